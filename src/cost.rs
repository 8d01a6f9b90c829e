//! Live cost model for self-hosted clusters.
//!
//! A cluster's hourly price is turned into an effective $/1K-token figure from
//! its measured throughput:
//!
//! ```text
//! cost_per_1k = cost_per_hour / (tokens_per_second * 3600) * overhead_factor * 1000
//! ```
//!
//! Every successful computation is appended to a bounded per-cluster history
//! (the last [`HISTORY_CAPACITY`] values, oldest evicted first) so averages can
//! be reported. Per-target records live in a [`DashMap`], so updates to one
//! cluster never block reads of another.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Number of computed values retained per cluster.
pub const HISTORY_CAPACITY: usize = 100;

/// Number of recent samples averaged in [`CostEngine::snapshot`].
const SNAPSHOT_AVERAGE_WINDOW: usize = 10;

/// Default idle-headroom multiplier.
pub const DEFAULT_OVERHEAD_FACTOR: f64 = 1.10;

#[derive(Debug)]
struct CostRecord {
    cost_per_hour: f64,
    last_tokens_per_sec: f64,
    history: VecDeque<f64>,
    last_update: Option<DateTime<Utc>>,
}

impl CostRecord {
    fn new(cost_per_hour: f64) -> Self {
        Self {
            cost_per_hour,
            last_tokens_per_sec: 0.0,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            last_update: None,
        }
    }

    fn push(&mut self, value: f64) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(value);
    }

    fn average(&self, last_n: usize) -> Option<f64> {
        let n = last_n.min(self.history.len());
        if n == 0 {
            return None;
        }
        let sum: f64 = self.history.iter().rev().take(n).sum();
        Some(sum / n as f64)
    }
}

/// Point-in-time cost information for one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct CostInfo {
    pub cost_per_hour: f64,
    pub last_tokens_per_sec: f64,
    pub last_cost_per_1k: Option<f64>,
    /// Average of the last 10 values, once at least 10 exist.
    pub avg_cost_per_1k: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Per-cluster cost tracking.
#[derive(Debug)]
pub struct CostEngine {
    records: DashMap<String, CostRecord>,
    overhead_factor: f64,
}

impl Default for CostEngine {
    fn default() -> Self {
        Self::new(DEFAULT_OVERHEAD_FACTOR)
    }
}

impl CostEngine {
    pub fn new(overhead_factor: f64) -> Self {
        Self {
            records: DashMap::new(),
            overhead_factor,
        }
    }

    pub fn overhead_factor(&self) -> f64 {
        self.overhead_factor
    }

    /// Start tracking a cluster. Re-registering resets its history.
    pub fn register(&self, target: &str, cost_per_hour: f64) {
        self.records
            .insert(target.to_string(), CostRecord::new(cost_per_hour));
    }

    /// Compute the current $/1K tokens for `target` at the given throughput.
    ///
    /// Returns `f64::INFINITY` for unknown targets or non-positive throughput,
    /// so such a target never wins a cost comparison. A finite result is
    /// recorded in the target's history as a side effect.
    pub fn cost_per_1k(&self, target: &str, tokens_per_second: f64) -> f64 {
        if tokens_per_second <= 0.0 || tokens_per_second.is_nan() {
            return f64::INFINITY;
        }

        let Some(mut record) = self.records.get_mut(target) else {
            return f64::INFINITY;
        };

        let tokens_per_hour = tokens_per_second * 3600.0;
        let cost = (record.cost_per_hour / tokens_per_hour) * self.overhead_factor * 1000.0;

        record.last_tokens_per_sec = tokens_per_second;
        record.last_update = Some(Utc::now());
        record.push(cost);

        cost
    }

    /// Average of the last `last_n` computed values, or `None` with no history.
    pub fn average_cost(&self, target: &str, last_n: usize) -> Option<f64> {
        self.records.get(target)?.average(last_n)
    }

    /// Most recently computed value.
    pub fn last_cost(&self, target: &str) -> Option<f64> {
        self.records.get(target)?.history.back().copied()
    }

    /// Number of values currently held in the target's history.
    pub fn history_len(&self, target: &str) -> usize {
        self.records
            .get(target)
            .map(|r| r.history.len())
            .unwrap_or(0)
    }

    /// Administrative override of a cluster's hourly price.
    ///
    /// Returns false if the target is not registered.
    pub fn update_cost_per_hour(&self, target: &str, cost_per_hour: f64) -> bool {
        match self.records.get_mut(target) {
            Some(mut record) => {
                tracing::info!(
                    cluster = %target,
                    old = record.cost_per_hour,
                    new = cost_per_hour,
                    "Cluster hourly cost overridden"
                );
                record.cost_per_hour = cost_per_hour;
                true
            }
            None => false,
        }
    }

    /// Cost information for every registered cluster, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, CostInfo> {
        self.records
            .iter()
            .map(|entry| {
                let record = entry.value();
                let avg = if record.history.len() >= SNAPSHOT_AVERAGE_WINDOW {
                    record.average(SNAPSHOT_AVERAGE_WINDOW)
                } else {
                    None
                };
                (
                    entry.key().clone(),
                    CostInfo {
                        cost_per_hour: record.cost_per_hour,
                        last_tokens_per_sec: record.last_tokens_per_sec,
                        last_cost_per_1k: record.history.back().copied(),
                        avg_cost_per_1k: avg,
                        last_update: record.last_update,
                    },
                )
            })
            .collect()
    }
}
