//! Prometheus metrics for the router.
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `llm_router_requests_total` | Counter | `target`, `status` |
//! | `llm_router_request_duration_seconds` | Histogram | `target` |
//! | `llm_router_routing_decisions_total` | Counter | `target`, `type`, `reason` |
//! | `llm_router_cluster_health` | Gauge | `cluster`, `provider`, `region` |
//! | `llm_router_cluster_cost_per_1k_tokens` | Gauge | `cluster`, `provider`, `region` |
//! | `llm_router_provider_health` | Gauge | `provider`, `type` |
//! | `llm_router_provider_cost_per_1k_tokens` | Gauge | `provider`, `model` |
//! | `llm_router_external_requests_total` | Counter | `provider`, `model`, `status` |
//! | `llm_router_tokens_total` | Counter | `provider`, `type` |
//!
//! The registry is owned by [`Metrics`] rather than a process global, so
//! every app instance (and every test) exports its own series.

use prometheus::core::Collector;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::proxy::types::Usage;
use crate::router::{RouteDecision, Router};

/// Target label used when no target was selected.
pub const NO_TARGET: &str = "none";

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics setup failed: {}", e))
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(metrics_error)?;
    Ok(collector)
}

/// All router metrics and the registry that exports them.
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    routing_decisions: IntCounterVec,
    cluster_health: GaugeVec,
    cluster_cost: GaugeVec,
    provider_health: GaugeVec,
    provider_cost: GaugeVec,
    external_requests: IntCounterVec,
    tokens_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("llm_router_requests_total", "Total requests by target and status"),
                &["target", "status"],
            )
            .map_err(metrics_error)?,
        )?;
        let request_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "llm_router_request_duration_seconds",
                    "Request duration by target",
                ),
                &["target"],
            )
            .map_err(metrics_error)?,
        )?;
        let routing_decisions = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "llm_router_routing_decisions_total",
                    "Routing decisions by target, type and reason",
                ),
                &["target", "type", "reason"],
            )
            .map_err(metrics_error)?,
        )?;
        let cluster_health = register(
            &registry,
            GaugeVec::new(
                Opts::new("llm_router_cluster_health", "1 if the cluster is healthy"),
                &["cluster", "provider", "region"],
            )
            .map_err(metrics_error)?,
        )?;
        let cluster_cost = register(
            &registry,
            GaugeVec::new(
                Opts::new(
                    "llm_router_cluster_cost_per_1k_tokens",
                    "Live cluster cost in dollars per 1K tokens",
                ),
                &["cluster", "provider", "region"],
            )
            .map_err(metrics_error)?,
        )?;
        let provider_health = register(
            &registry,
            GaugeVec::new(
                Opts::new("llm_router_provider_health", "1 if the provider is healthy"),
                &["provider", "type"],
            )
            .map_err(metrics_error)?,
        )?;
        let provider_cost = register(
            &registry,
            GaugeVec::new(
                Opts::new(
                    "llm_router_provider_cost_per_1k_tokens",
                    "Average of input and output price per 1K tokens",
                ),
                &["provider", "model"],
            )
            .map_err(metrics_error)?,
        )?;
        let external_requests = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "llm_router_external_requests_total",
                    "External provider requests by model and status",
                ),
                &["provider", "model", "status"],
            )
            .map_err(metrics_error)?,
        )?;
        let tokens_total = register(
            &registry,
            CounterVec::new(
                Opts::new("llm_router_tokens_total", "Tokens by provider and direction"),
                &["provider", "type"],
            )
            .map_err(metrics_error)?,
        )?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            routing_decisions,
            cluster_health,
            cluster_cost,
            provider_health,
            provider_cost,
            external_requests,
            tokens_total,
        })
    }

    /// Count a finished request. `status` is the HTTP status code.
    pub fn record_request(&self, target: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[target, status.as_str()])
            .inc();
        if target != NO_TARGET {
            self.request_duration
                .with_label_values(&[target])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_decision(&self, decision: &RouteDecision) {
        self.routing_decisions
            .with_label_values(&[
                decision.target.name.as_str(),
                decision.target.kind.as_str(),
                decision.reason.as_str(),
            ])
            .inc();
    }

    /// Count a provider call; `status` is `success` or `error`.
    pub fn record_external(&self, provider: &str, model: &str, status: &str) {
        self.external_requests
            .with_label_values(&[provider, model, status])
            .inc();
    }

    pub fn record_tokens(&self, provider: &str, usage: Usage) {
        self.tokens_total
            .with_label_values(&[provider, "input"])
            .inc_by(f64::from(usage.prompt_tokens));
        self.tokens_total
            .with_label_values(&[provider, "output"])
            .inc_by(f64::from(usage.completion_tokens));
    }

    /// Update health and cost gauges from live router state.
    pub fn refresh(&self, router: &Router, clusters: &[ClusterConfig]) {
        let snapshot = router.health().all_snapshot();

        for cluster in clusters {
            let labels = [
                cluster.name.as_str(),
                cluster.provider.as_str(),
                cluster.region.as_str(),
            ];
            let metrics = snapshot.get(&cluster.name);
            let healthy = metrics.map(|m| m.healthy).unwrap_or(false);
            self.cluster_health
                .with_label_values(&labels)
                .set(if healthy { 1.0 } else { 0.0 });

            if let Some(m) = metrics.filter(|m| m.tokens_per_second > 0.0) {
                let cost = router.costs().cost_per_1k(&cluster.name, m.tokens_per_second);
                if cost.is_finite() {
                    self.cluster_cost.with_label_values(&labels).set(cost);
                }
            }
        }

        let registry = router.providers();
        for provider in registry.all() {
            let healthy = registry.is_healthy(provider.name());
            self.provider_health
                .with_label_values(&[provider.name(), provider.kind().as_str()])
                .set(if healthy { 1.0 } else { 0.0 });

            for (model, pricing) in provider.pricing_table() {
                self.provider_cost
                    .with_label_values(&[provider.name(), model.as_str()])
                    .set(pricing.average_per_1k());
            }
        }
    }

    /// Refresh the gauges every `interval` until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        router: Arc<Router>,
        clusters: Vec<ClusterConfig>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.refresh(&router, &clusters);
        }

        tracing::info!("Metrics refresh stopped");
    }

    /// Text exposition of every registered series.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{RouteReason, Target, TargetKind};

    #[test]
    fn test_two_instances_do_not_collide() {
        assert!(Metrics::new().is_ok());
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_render_includes_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("gpu-a", 200, Duration::from_millis(40));
        metrics.record_request(NO_TARGET, 503, Duration::ZERO);
        metrics.record_decision(&RouteDecision {
            target: Target {
                name: "gpu-a".to_string(),
                kind: TargetKind::Cluster,
                endpoint: None,
                cost_per_1k: 0.002,
                latency_p95_ms: Some(100.0),
                queue_depth: 0,
            },
            reason: RouteReason::HybridCluster,
        });
        metrics.record_tokens("openai", Usage::new(10, 4));
        metrics.record_external("openai", "gpt-4", "success");

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"llm_router_requests_total{status="200",target="gpu-a"} 1"#));
        assert!(text.contains(r#"llm_router_requests_total{status="503",target="none"} 1"#));
        assert!(text.contains(
            r#"llm_router_routing_decisions_total{reason="hybrid_cluster",target="gpu-a",type="cluster"} 1"#
        ));
        assert!(text.contains(r#"llm_router_tokens_total{provider="openai",type="output"} 4"#));
        assert!(text.contains(
            r#"llm_router_external_requests_total{model="gpt-4",provider="openai",status="success"} 1"#
        ));
        assert!(!text.contains(r#"llm_router_request_duration_seconds_count{target="none"}"#));
    }
}
