//! Candidate construction and selection policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::{ClusterConfig, RouterConfig};
use crate::cost::CostEngine;
use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::providers::ProviderRegistry;

/// Selection policy, the `router.routingStrategy` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Cost,
    Latency,
    ClusterFirst,
    ExternalFirst,
    #[default]
    Hybrid,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Cost => "cost",
            RoutingStrategy::Latency => "latency",
            RoutingStrategy::ClusterFirst => "cluster_first",
            RoutingStrategy::ExternalFirst => "external_first",
            RoutingStrategy::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a target is a self-hosted cluster or an external provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Cluster,
    Provider,
}

impl TargetKind {
    /// Label used in metrics and response headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Cluster => "cluster",
            TargetKind::Provider => "provider",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routable backend as seen at selection time.
///
/// Built fresh for every selection from live state; never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    /// Base URL; clusters only.
    pub endpoint: Option<String>,
    /// Effective $/1K tokens.
    pub cost_per_1k: f64,
    /// Reported p95 latency; clusters only.
    pub latency_p95_ms: Option<f64>,
    pub queue_depth: u32,
}

impl Target {
    pub fn is_cluster(&self) -> bool {
        self.kind == TargetKind::Cluster
    }
}

/// Machine-readable explanation of a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    LowestCost,
    LowestLatency,
    ClusterFirst,
    ExternalFallback,
    ExternalFirst,
    ClusterFallback,
    HybridCluster,
    HybridCheapest,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::LowestCost => "lowest_cost",
            RouteReason::LowestLatency => "lowest_latency",
            RouteReason::ClusterFirst => "cluster_first",
            RouteReason::ExternalFallback => "external_fallback",
            RouteReason::ExternalFirst => "external_first",
            RouteReason::ClusterFallback => "cluster_fallback",
            RouteReason::HybridCluster => "hybrid_cluster",
            RouteReason::HybridCheapest => "hybrid_cheapest",
        }
    }
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one selection.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub target: Target,
    pub reason: RouteReason,
}

/// Cheapest target; ties go to the earliest.
fn cheapest<'a>(targets: impl IntoIterator<Item = &'a Target>) -> Option<&'a Target> {
    targets.into_iter().fold(None, |best, t| match best {
        Some(b) if b.cost_per_1k <= t.cost_per_1k => Some(b),
        _ => Some(t),
    })
}

/// Apply `strategy` to an ordered candidate list.
///
/// Pure: the result depends only on the arguments. Returns `None` for an
/// empty list.
pub fn select(
    strategy: RoutingStrategy,
    candidates: &[Target],
    cluster_cost_threshold: f64,
) -> Option<RouteDecision> {
    let first = candidates.first()?;
    let clusters = || candidates.iter().filter(|t| t.is_cluster());
    let providers = || candidates.iter().filter(|t| !t.is_cluster());

    let (target, reason) = match strategy {
        RoutingStrategy::Cost => (cheapest(candidates)?, RouteReason::LowestCost),
        RoutingStrategy::Latency => {
            let fastest = clusters().fold(None, |best: Option<&Target>, t| match best {
                Some(b) if b.latency_p95_ms <= t.latency_p95_ms => Some(b),
                _ => Some(t),
            });
            (fastest.unwrap_or(first), RouteReason::LowestLatency)
        }
        RoutingStrategy::ClusterFirst => match clusters().next() {
            Some(t) => (t, RouteReason::ClusterFirst),
            None => (first, RouteReason::ExternalFallback),
        },
        RoutingStrategy::ExternalFirst => match providers().next() {
            Some(t) => (t, RouteReason::ExternalFirst),
            None => (first, RouteReason::ClusterFallback),
        },
        RoutingStrategy::Hybrid => {
            match cheapest(clusters().filter(|t| t.cost_per_1k <= cluster_cost_threshold)) {
                Some(t) => (t, RouteReason::HybridCluster),
                None => (cheapest(candidates)?, RouteReason::HybridCheapest),
            }
        }
    };

    Some(RouteDecision {
        target: target.clone(),
        reason,
    })
}

/// Composes cluster health, cluster cost and provider health into routing
/// decisions.
pub struct Router {
    strategy: RoutingStrategy,
    cluster_cost_threshold: f64,
    max_latency_ms: f64,
    max_queue_depth: u32,
    enable_external_fallback: bool,
    health: Arc<HealthMonitor>,
    costs: Arc<CostEngine>,
    providers: Arc<ProviderRegistry>,
}

impl Router {
    pub fn new(
        config: &RouterConfig,
        health: Arc<HealthMonitor>,
        costs: Arc<CostEngine>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            strategy: config.routing_strategy,
            cluster_cost_threshold: config.cluster_cost_threshold,
            max_latency_ms: config.max_latency_ms as f64,
            max_queue_depth: config.max_queue_depth,
            enable_external_fallback: config.enable_external_fallback,
            health,
            costs,
            providers,
        }
    }

    /// Register configured clusters with the health monitor and cost engine.
    pub fn register_clusters(&self, clusters: &[ClusterConfig]) {
        for cluster in clusters {
            self.health.register(&cluster.name, &cluster.endpoint);
            self.costs.register(&cluster.name, cluster.cost_per_hour);
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn costs(&self) -> &Arc<CostEngine> {
        &self.costs
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Current candidates: healthy clusters within SLA bounds sorted by name,
    /// then healthy providers in configuration order.
    ///
    /// Reads the latest completed health snapshot; never waits on a probe.
    pub fn candidates(&self) -> Vec<Target> {
        let mut targets = Vec::new();

        for (name, metrics) in self.health.healthy_snapshot() {
            if metrics.latency_p95_ms > self.max_latency_ms {
                tracing::debug!(
                    cluster = %name,
                    latency_p95_ms = metrics.latency_p95_ms,
                    "Cluster excluded: latency above SLA"
                );
                continue;
            }
            if metrics.queue_depth > self.max_queue_depth {
                tracing::debug!(
                    cluster = %name,
                    queue_depth = metrics.queue_depth,
                    "Cluster excluded: queue above SLA"
                );
                continue;
            }
            let cost_per_1k = self.costs.cost_per_1k(&name, metrics.tokens_per_second);
            targets.push(Target {
                name,
                kind: TargetKind::Cluster,
                endpoint: Some(metrics.endpoint),
                cost_per_1k,
                latency_p95_ms: Some(metrics.latency_p95_ms),
                queue_depth: metrics.queue_depth,
            });
        }

        if self.enable_external_fallback {
            for provider in self.providers.all() {
                if !self.providers.is_healthy(provider.name()) {
                    continue;
                }
                targets.push(Target {
                    name: provider.name().to_string(),
                    kind: TargetKind::Provider,
                    endpoint: None,
                    cost_per_1k: provider.routing_cost_per_1k(),
                    latency_p95_ms: None,
                    queue_depth: 0,
                });
            }
        }

        targets
    }

    /// Pick the target for one request.
    pub fn select_target(&self) -> Result<RouteDecision> {
        let candidates = self.candidates();
        let Some(decision) = select(self.strategy, &candidates, self.cluster_cost_threshold)
        else {
            tracing::warn!(strategy = %self.strategy, "No available targets");
            return Err(Error::NoTargets);
        };

        tracing::debug!(
            selected = %decision.target.name,
            kind = %decision.target.kind,
            reason = %decision.reason,
            cost_per_1k = decision.target.cost_per_1k,
            candidates = candidates.len(),
            "Selected target"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        ModelPricing, PricingTable, ProviderAdapter, ProviderKind, ChatReply,
    };
    use crate::health::{BackendStats, ProbeOutcome};
    use crate::proxy::types::ChatCompletionRequest;
    use async_trait::async_trait;
    use std::time::Duration;

    fn cluster(name: &str, cost: f64, latency: f64) -> Target {
        Target {
            name: name.to_string(),
            kind: TargetKind::Cluster,
            endpoint: Some(format!("http://{}", name)),
            cost_per_1k: cost,
            latency_p95_ms: Some(latency),
            queue_depth: 0,
        }
    }

    fn provider(name: &str, cost: f64) -> Target {
        Target {
            name: name.to_string(),
            kind: TargetKind::Provider,
            endpoint: None,
            cost_per_1k: cost,
            latency_p95_ms: None,
            queue_depth: 0,
        }
    }

    fn pick(strategy: RoutingStrategy, targets: &[Target]) -> (String, RouteReason) {
        let decision = select(strategy, targets, 0.01).unwrap();
        (decision.target.name, decision.reason)
    }

    #[test]
    fn test_hybrid_prefers_cluster_under_threshold() {
        let targets = [
            cluster("a", 0.005, 100.0),
            cluster("b", 0.02, 100.0),
            provider("c", 0.001),
        ];
        assert_eq!(
            pick(RoutingStrategy::Hybrid, &targets),
            ("a".to_string(), RouteReason::HybridCluster)
        );
    }

    #[test]
    fn test_hybrid_falls_back_to_global_cheapest() {
        let targets = [
            cluster("a", 0.05, 100.0),
            cluster("b", 0.02, 100.0),
            provider("c", 0.001),
        ];
        assert_eq!(
            pick(RoutingStrategy::Hybrid, &targets),
            ("c".to_string(), RouteReason::HybridCheapest)
        );
    }

    #[test]
    fn test_hybrid_threshold_is_inclusive() {
        let targets = [cluster("a", 0.01, 100.0), provider("c", 0.001)];
        assert_eq!(pick(RoutingStrategy::Hybrid, &targets).1, RouteReason::HybridCluster);
    }

    #[test]
    fn test_cost_ties_go_to_first() {
        let targets = [
            cluster("a", 0.002, 100.0),
            provider("b", 0.002),
            provider("c", 0.003),
        ];
        assert_eq!(
            pick(RoutingStrategy::Cost, &targets),
            ("a".to_string(), RouteReason::LowestCost)
        );
    }

    #[test]
    fn test_cost_never_picks_infinite() {
        let targets = [cluster("stalled", f64::INFINITY, 10.0), provider("p", 0.5)];
        assert_eq!(pick(RoutingStrategy::Cost, &targets).0, "p");
    }

    #[test]
    fn test_latency_ignores_providers() {
        let targets = [
            provider("p", 0.001),
            cluster("slow", 0.01, 900.0),
            cluster("fast", 0.02, 120.0),
        ];
        assert_eq!(
            pick(RoutingStrategy::Latency, &targets),
            ("fast".to_string(), RouteReason::LowestLatency)
        );
    }

    #[test]
    fn test_latency_without_clusters_takes_first() {
        let targets = [provider("p", 0.01), provider("q", 0.001)];
        assert_eq!(pick(RoutingStrategy::Latency, &targets).0, "p");
    }

    #[test]
    fn test_first_policies_and_fallbacks() {
        let mixed = [cluster("a", 0.5, 100.0), provider("p", 0.001)];
        assert_eq!(
            pick(RoutingStrategy::ClusterFirst, &mixed),
            ("a".to_string(), RouteReason::ClusterFirst)
        );
        assert_eq!(
            pick(RoutingStrategy::ExternalFirst, &mixed),
            ("p".to_string(), RouteReason::ExternalFirst)
        );

        let only_providers = [provider("p", 0.001)];
        assert_eq!(
            pick(RoutingStrategy::ClusterFirst, &only_providers).1,
            RouteReason::ExternalFallback
        );
        let only_clusters = [cluster("a", 0.5, 100.0)];
        assert_eq!(
            pick(RoutingStrategy::ExternalFirst, &only_clusters).1,
            RouteReason::ClusterFallback
        );
    }

    #[test]
    fn test_empty_candidates() {
        for strategy in [
            RoutingStrategy::Cost,
            RoutingStrategy::Latency,
            RoutingStrategy::ClusterFirst,
            RoutingStrategy::ExternalFirst,
            RoutingStrategy::Hybrid,
        ] {
            assert!(select(strategy, &[], 0.01).is_none());
        }
    }

    #[test]
    fn test_strategy_parses_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: RoutingStrategy,
        }
        let w: Wrapper = toml::from_str("strategy = \"external_first\"").unwrap();
        assert_eq!(w.strategy, RoutingStrategy::ExternalFirst);
        assert_eq!(RoutingStrategy::default(), RoutingStrategy::Hybrid);
    }

    /// Provider with a single fixed-price model.
    struct FixedPriceProvider {
        name: String,
        pricing: PricingTable,
    }

    impl FixedPriceProvider {
        fn new(name: &str, average: f64) -> Self {
            let mut pricing = PricingTable::new();
            pricing.insert(
                "m".to_string(),
                ModelPricing::new(average, average, 4096, 4096),
            );
            Self {
                name: name.to_string(),
                pricing,
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for FixedPriceProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }
        fn default_model(&self) -> &str {
            "m"
        }
        fn pricing_table(&self) -> &PricingTable {
            &self.pricing
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
        async fn forward(&self, _request: ChatCompletionRequest) -> Result<ChatReply> {
            Err(Error::Internal("not used".to_string()))
        }
    }

    /// One healthy cluster at 0.003/1K and one healthy provider at 0.0008/1K.
    fn router(strategy: RoutingStrategy) -> Router {
        let config = RouterConfig {
            routing_strategy: strategy,
            overhead_factor: 1.0,
            ..RouterConfig::default()
        };
        let health = Arc::new(HealthMonitor::new(Duration::from_secs(30)));
        let costs = Arc::new(CostEngine::new(1.0));
        let providers = Arc::new(ProviderRegistry::new(vec![Arc::new(
            FixedPriceProvider::new("ext", 0.0008),
        )]));

        // Default stats report 10 tok/s: 0.108 $/h -> 0.003 $/1K.
        health.register("gpu", "http://gpu.internal");
        costs.register("gpu", 0.108);
        health.force_healthy("gpu");
        providers.set_healthy("ext", true);

        Router::new(&config, health, costs, providers)
    }

    #[test]
    fn test_end_to_end_cost_picks_provider() {
        let router = router(RoutingStrategy::Cost);
        for _ in 0..5 {
            let decision = router.select_target().unwrap();
            assert_eq!(decision.target.name, "ext");
            assert_eq!(decision.target.kind, TargetKind::Provider);
        }
    }

    #[test]
    fn test_end_to_end_cluster_first_picks_cluster() {
        let router = router(RoutingStrategy::ClusterFirst);
        for _ in 0..5 {
            let decision = router.select_target().unwrap();
            assert_eq!(decision.target.name, "gpu");
            assert_eq!(decision.reason, RouteReason::ClusterFirst);
        }
        let cost = router.costs().last_cost("gpu").unwrap();
        assert!((cost - 0.003).abs() < 1e-12);
    }

    /// Report load figures for `name` as a successful health check would.
    fn report(router: &Router, name: &str, latency_p95_ms: f64, queue_depth: u32) {
        let stats = BackendStats {
            queue_depth,
            latency_p95_ms,
            ..BackendStats::default()
        };
        router.health().record(name, &ProbeOutcome::Healthy(stats), 5.0);
    }

    fn candidate_names(router: &Router) -> Vec<String> {
        router.candidates().into_iter().map(|t| t.name).collect()
    }

    #[test]
    fn test_sla_excludes_slow_cluster() {
        // Defaults: 5000 ms p95 latency, queue depth 10.
        let router = router(RoutingStrategy::ClusterFirst);
        report(&router, "gpu", 5000.5, 0);
        assert_eq!(candidate_names(&router), vec!["ext"]);
    }

    #[test]
    fn test_sla_excludes_deep_queue() {
        let router = router(RoutingStrategy::ClusterFirst);
        report(&router, "gpu", 100.0, 11);
        assert_eq!(candidate_names(&router), vec!["ext"]);
    }

    #[test]
    fn test_sla_limits_are_inclusive() {
        let router = router(RoutingStrategy::ClusterFirst);
        report(&router, "gpu", 5000.0, 10);

        let candidates = router.candidates();
        assert_eq!(candidates[0].name, "gpu");
        assert_eq!(candidates[0].latency_p95_ms, Some(5000.0));
        assert_eq!(candidates[0].queue_depth, 10);
        assert_eq!(router.select_target().unwrap().target.name, "gpu");
    }

    #[test]
    fn test_all_clusters_outside_sla_fall_back_to_provider() {
        let router = router(RoutingStrategy::ClusterFirst);
        router.health().register("b-gpu", "http://b.internal");
        router.costs().register("b-gpu", 0.108);
        report(&router, "gpu", 9000.0, 0);
        report(&router, "b-gpu", 50.0, 25);

        let decision = router.select_target().unwrap();
        assert_eq!(decision.target.name, "ext");
        assert_eq!(decision.target.kind, TargetKind::Provider);
        assert_eq!(decision.reason, RouteReason::ExternalFallback);
    }

    #[test]
    fn test_candidates_order_and_sla() {
        let router = router(RoutingStrategy::Hybrid);
        router.health().register("b-gpu", "http://b.internal");
        router.costs().register("b-gpu", 0.108);
        router.health().force_healthy("b-gpu");

        let names: Vec<_> = router.candidates().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["b-gpu", "gpu", "ext"]);
    }

    #[test]
    fn test_no_targets_when_everything_down() {
        let router = router(RoutingStrategy::Hybrid);
        router.health().mark_unhealthy("gpu", "maintenance");
        router.providers().set_healthy("ext", false);
        assert!(matches!(router.select_target(), Err(Error::NoTargets)));
    }

    #[test]
    fn test_external_fallback_disabled() {
        let config = RouterConfig {
            routing_strategy: RoutingStrategy::Cost,
            enable_external_fallback: false,
            ..RouterConfig::default()
        };
        let providers = Arc::new(ProviderRegistry::new(vec![Arc::new(
            FixedPriceProvider::new("ext", 0.0008),
        )]));
        providers.set_healthy("ext", true);
        let router = Router::new(
            &config,
            Arc::new(HealthMonitor::new(Duration::from_secs(30))),
            Arc::new(CostEngine::default()),
            providers,
        );
        assert!(router.candidates().is_empty());
    }
}
