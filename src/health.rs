//! Cluster health polling with failure hysteresis.
//!
//! Each registered cluster is probed once per tick; all probes of a tick run
//! concurrently and are joined before the next tick starts. A probe is a
//! `GET {endpoint}/health`, followed on success by a best-effort
//! `GET {endpoint}/stats` for queue depth, throughput and p95 latency.
//!
//! Hysteresis is asymmetric:
//! - a cluster is marked unhealthy only after [`CONSECUTIVE_ERROR_THRESHOLD`]
//!   failed probes in a row
//! - a single successful probe marks it healthy again and resets the counter
//!
//! Readers get cloned snapshots; they never wait on an in-flight probe.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Consecutive failed probes before a cluster is marked unhealthy.
pub const CONSECUTIVE_ERROR_THRESHOLD: u32 = 3;

/// Per-request timeout for liveness and stats probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_TOKENS_PER_SECOND: f64 = 10.0;
const DEFAULT_LATENCY_P95_MS: f64 = 1000.0;
const DEFAULT_QUEUE_DEPTH: u32 = 0;

/// Health and load metrics for one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterMetrics {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: f64,
    pub latency_p95_ms: f64,
    pub queue_depth: u32,
    pub tokens_per_second: f64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub endpoint: String,
}

/// Load figures reported by a cluster's stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendStats {
    pub queue_depth: u32,
    pub tokens_per_second: f64,
    pub latency_p95_ms: f64,
}

impl Default for BackendStats {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            tokens_per_second: DEFAULT_TOKENS_PER_SECOND,
            latency_p95_ms: DEFAULT_LATENCY_P95_MS,
        }
    }
}

/// Wire shape of `GET /stats`. Every field is optional.
#[derive(Debug, Deserialize)]
struct StatsPayload {
    queue_depth: Option<i64>,
    tokens_per_second: Option<f64>,
    latency_p95_ms: Option<f64>,
}

impl From<StatsPayload> for BackendStats {
    fn from(payload: StatsPayload) -> Self {
        let mut stats = BackendStats::default();
        if let Some(depth) = payload.queue_depth.filter(|d| *d >= 0) {
            stats.queue_depth = u32::try_from(depth).unwrap_or(u32::MAX);
        }
        if let Some(tps) = payload.tokens_per_second.filter(|t| *t > 0.0) {
            stats.tokens_per_second = tps;
        }
        if let Some(latency) = payload.latency_p95_ms.filter(|l| *l > 0.0) {
            stats.latency_p95_ms = latency;
        }
        stats
    }
}

/// Result of probing one cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Healthy(BackendStats),
    Failed(String),
}

/// A health state change produced by a probe or an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameHealthy,
    BecameUnhealthy,
}

impl ClusterMetrics {
    /// New clusters start unhealthy until their first successful probe.
    fn new(endpoint: &str) -> Self {
        let defaults = BackendStats::default();
        Self {
            healthy: false,
            last_check: Utc::now(),
            response_time_ms: 0.0,
            latency_p95_ms: defaults.latency_p95_ms,
            queue_depth: defaults.queue_depth,
            tokens_per_second: defaults.tokens_per_second,
            error_count: 0,
            consecutive_errors: 0,
            endpoint: endpoint.to_string(),
        }
    }

    /// Apply a probe result.
    ///
    /// On failure the last known load figures are kept.
    pub(crate) fn record_probe(
        &mut self,
        outcome: &ProbeOutcome,
        response_time_ms: f64,
    ) -> Option<Transition> {
        let was_healthy = self.healthy;
        self.last_check = Utc::now();
        self.response_time_ms = response_time_ms;

        match outcome {
            ProbeOutcome::Healthy(stats) => {
                self.latency_p95_ms = stats.latency_p95_ms;
                self.queue_depth = stats.queue_depth;
                self.tokens_per_second = stats.tokens_per_second;
                self.consecutive_errors = 0;
                self.healthy = true;
                (!was_healthy).then_some(Transition::BecameHealthy)
            }
            ProbeOutcome::Failed(_) => {
                self.error_count += 1;
                self.consecutive_errors += 1;
                if self.consecutive_errors >= CONSECUTIVE_ERROR_THRESHOLD {
                    self.healthy = false;
                }
                (was_healthy && !self.healthy).then_some(Transition::BecameUnhealthy)
            }
        }
    }
}

/// Polls cluster liveness and load on a fixed interval.
pub struct HealthMonitor {
    clusters: DashMap<String, ClusterMetrics>,
    interval: Duration,
    client: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            clusters: DashMap::new(),
            interval,
            client,
        }
    }

    /// Start monitoring a cluster.
    pub fn register(&self, name: &str, endpoint: &str) {
        self.clusters
            .insert(name.to_string(), ClusterMetrics::new(endpoint));
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Run the polling loop until `cancel` fires.
    ///
    /// The first tick fires immediately. Cancellation is observed between
    /// ticks, so an in-flight round of probes is always joined first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            clusters = self.clusters.len(),
            interval_secs = self.interval.as_secs(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.check_all().await;
        }

        tracing::info!("Health monitor stopped");
    }

    /// Probe every registered cluster concurrently and wait for all results.
    pub async fn check_all(&self) {
        let names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        futures::future::join_all(names.iter().map(|name| self.check_cluster(name))).await;
    }

    async fn check_cluster(&self, name: &str) {
        // Clone the endpoint out so no map guard is held across the probe.
        let Some(endpoint) = self.clusters.get(name).map(|m| m.endpoint.clone()) else {
            return;
        };

        let start = Instant::now();
        let outcome = self.probe(&endpoint).await;
        let response_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record(name, &outcome, response_time_ms);
    }

    /// Apply one probe outcome to a registered cluster and log any transition.
    pub(crate) fn record(
        &self,
        name: &str,
        outcome: &ProbeOutcome,
        response_time_ms: f64,
    ) -> Option<Transition> {
        let mut metrics = self.clusters.get_mut(name)?;
        let transition = metrics.record_probe(outcome, response_time_ms);

        match (outcome, transition) {
            (_, Some(Transition::BecameUnhealthy)) => tracing::warn!(
                cluster = %name,
                consecutive_errors = metrics.consecutive_errors,
                "Cluster marked unhealthy after {} consecutive errors",
                metrics.consecutive_errors,
            ),
            (_, Some(Transition::BecameHealthy)) => tracing::info!(
                cluster = %name,
                response_ms = format!("{:.2}", response_time_ms),
                "Cluster healthy"
            ),
            (ProbeOutcome::Healthy(stats), None) => tracing::debug!(
                cluster = %name,
                response_ms = format!("{:.2}", response_time_ms),
                tokens_per_second = stats.tokens_per_second,
                queue_depth = stats.queue_depth,
                "Cluster is healthy"
            ),
            (ProbeOutcome::Failed(reason), None) => tracing::debug!(
                cluster = %name,
                reason = %reason,
                consecutive_errors = metrics.consecutive_errors,
                "Health check failed"
            ),
        }
        transition
    }

    async fn probe(&self, endpoint: &str) -> ProbeOutcome {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                ProbeOutcome::Healthy(self.fetch_stats(endpoint).await)
            }
            Ok(resp) => ProbeOutcome::Failed(format!("status {}", resp.status().as_u16())),
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }

    /// Best-effort load figures; any failure yields the conservative defaults.
    async fn fetch_stats(&self, endpoint: &str) -> BackendStats {
        let url = format!("{}/stats", endpoint.trim_end_matches('/'));
        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            _ => return BackendStats::default(),
        };
        match resp.json::<StatsPayload>().await {
            Ok(payload) => payload.into(),
            Err(_) => BackendStats::default(),
        }
    }

    /// Metrics for clusters that are currently healthy, sorted by name.
    pub fn healthy_snapshot(&self) -> BTreeMap<String, ClusterMetrics> {
        self.clusters
            .iter()
            .filter(|e| e.value().healthy)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Metrics for every registered cluster, sorted by name.
    pub fn all_snapshot(&self) -> BTreeMap<String, ClusterMetrics> {
        self.clusters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn cluster(&self, name: &str) -> Option<ClusterMetrics> {
        self.clusters.get(name).map(|m| m.clone())
    }

    /// Administrative override: mark a cluster healthy and clear its error streak.
    pub fn force_healthy(&self, name: &str) -> bool {
        let Some(mut metrics) = self.clusters.get_mut(name) else {
            return false;
        };
        metrics.healthy = true;
        metrics.consecutive_errors = 0;
        tracing::info!(cluster = %name, "Cluster manually marked healthy");
        true
    }

    /// Administrative override: mark a cluster unhealthy immediately.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) -> bool {
        let Some(mut metrics) = self.clusters.get_mut(name) else {
            return false;
        };
        metrics.healthy = false;
        metrics.error_count += 1;
        metrics.consecutive_errors += 1;
        tracing::warn!(cluster = %name, reason = %reason, "Cluster manually marked unhealthy");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok() -> ProbeOutcome {
        ProbeOutcome::Healthy(BackendStats::default())
    }

    fn fail() -> ProbeOutcome {
        ProbeOutcome::Failed("connection refused".to_string())
    }

    #[test]
    fn test_new_cluster_starts_unhealthy() {
        let m = ClusterMetrics::new("http://a");
        assert!(!m.healthy);
        assert_eq!(m.consecutive_errors, 0);
    }

    #[test]
    fn test_unhealthy_only_after_three_consecutive_errors() {
        let mut m = ClusterMetrics::new("http://a");
        assert_eq!(m.record_probe(&ok(), 1.0), Some(Transition::BecameHealthy));

        assert_eq!(m.record_probe(&fail(), 1.0), None);
        assert!(m.healthy);
        assert_eq!(m.record_probe(&fail(), 1.0), None);
        assert!(m.healthy);
        assert_eq!(m.consecutive_errors, 2);

        assert_eq!(
            m.record_probe(&fail(), 1.0),
            Some(Transition::BecameUnhealthy)
        );
        assert!(!m.healthy);
        assert_eq!(m.consecutive_errors, CONSECUTIVE_ERROR_THRESHOLD);
        assert_eq!(m.error_count, 3);
    }

    #[test]
    fn test_single_success_recovers_immediately() {
        let mut m = ClusterMetrics::new("http://a");
        for _ in 0..5 {
            m.record_probe(&fail(), 1.0);
        }
        assert!(!m.healthy);

        assert_eq!(m.record_probe(&ok(), 1.0), Some(Transition::BecameHealthy));
        assert!(m.healthy);
        assert_eq!(m.consecutive_errors, 0);
        assert_eq!(m.error_count, 5);
    }

    #[test]
    fn test_interleaved_success_resets_streak() {
        let mut m = ClusterMetrics::new("http://a");
        m.record_probe(&ok(), 1.0);
        m.record_probe(&fail(), 1.0);
        m.record_probe(&fail(), 1.0);
        m.record_probe(&ok(), 1.0);
        m.record_probe(&fail(), 1.0);
        m.record_probe(&fail(), 1.0);
        assert!(m.healthy);
        assert_eq!(m.consecutive_errors, 2);
    }

    #[test]
    fn test_failure_keeps_last_known_load() {
        let mut m = ClusterMetrics::new("http://a");
        let stats = BackendStats {
            queue_depth: 4,
            tokens_per_second: 250.0,
            latency_p95_ms: 320.0,
        };
        m.record_probe(&ProbeOutcome::Healthy(stats), 1.0);
        m.record_probe(&fail(), 9.0);
        assert_eq!(m.tokens_per_second, 250.0);
        assert_eq!(m.queue_depth, 4);
        assert_eq!(m.response_time_ms, 9.0);
    }

    #[test]
    fn test_stats_payload_falls_back_per_field() {
        let payload: StatsPayload =
            serde_json::from_str(r#"{"queue_depth": -1, "tokens_per_second": 0, "latency_p95_ms": 450.5}"#)
                .unwrap();
        let stats = BackendStats::from(payload);
        assert_eq!(stats.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert_eq!(stats.tokens_per_second, DEFAULT_TOKENS_PER_SECOND);
        assert_eq!(stats.latency_p95_ms, 450.5);
    }

    #[test]
    fn test_overrides() {
        let monitor = HealthMonitor::new(Duration::from_secs(30));
        monitor.register("a", "http://a");
        assert!(monitor.healthy_snapshot().is_empty());

        assert!(monitor.force_healthy("a"));
        assert_eq!(monitor.healthy_snapshot().len(), 1);

        assert!(monitor.mark_unhealthy("a", "maintenance"));
        let m = monitor.cluster("a").unwrap();
        assert!(!m.healthy);
        assert_eq!(m.error_count, 1);
        assert_eq!(m.consecutive_errors, 1);
        assert!(monitor.healthy_snapshot().is_empty());
        assert_eq!(monitor.all_snapshot().len(), 1);

        assert!(!monitor.force_healthy("missing"));
        assert!(!monitor.mark_unhealthy("missing", "x"));
    }
}
