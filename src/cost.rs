//! Process-wide, thread-safe accumulator of model usage.
//!
//! Rather than scattering usage bookkeeping across providers, every provider
//! reports through one `CostTracker` behind a lock, and totals are exact
//! sums of commutative additions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-model running totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub call_count: u64,
}

impl ModelUsage {
    fn add(&mut self, other: &UsageReport) {
        self.cost += other.cost;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.call_count += 1;
    }
}

/// One usage observation reported by a provider after a call completes.
#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    pub model: String,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

struct Totals {
    per_model: HashMap<String, ModelUsage>,
    global: ModelUsage,
}

/// Process-wide cost/usage registry. Cheap to clone (wraps an `Arc`-free
/// `RwLock` behind `&self`, intended to be held in a single long-lived
/// `Arc<CostTracker>`). Deliberately a caller-constructed, explicitly
/// threaded-through instance rather than a global static, so tests can each
/// hold their own tracker.
pub struct CostTracker {
    totals: RwLock<Totals>,
    started_at: DateTime<Utc>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    pub fn new() -> Self {
        Self {
            totals: RwLock::new(Totals {
                per_model: HashMap::new(),
                global: ModelUsage::default(),
            }),
            started_at: Utc::now(),
        }
    }

    /// Record a usage observation. Additions are commutative: the order in
    /// which concurrent callers report usage does not affect the final
    /// totals.
    pub fn add_usage(&self, report: UsageReport) {
        let mut totals = self.totals.write().expect("cost tracker lock poisoned");
        totals
            .per_model
            .entry(report.model.clone())
            .or_default()
            .add(&report);
        totals.global.add(&report);
    }

    pub fn usage_for(&self, model: &str) -> ModelUsage {
        let totals = self.totals.read().expect("cost tracker lock poisoned");
        totals.per_model.get(model).cloned().unwrap_or_default()
    }

    pub fn global_usage(&self) -> ModelUsage {
        self.totals
            .read()
            .expect("cost tracker lock poisoned")
            .global
            .clone()
    }

    pub fn wall_time_anchor(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_sum_of_reported_usages() {
        let tracker = CostTracker::new();
        tracker.add_usage(UsageReport {
            model: "gpt".into(),
            cost: 0.10,
            input_tokens: 100,
            output_tokens: 50,
            cached_tokens: 0,
        });
        tracker.add_usage(UsageReport {
            model: "gpt".into(),
            cost: 0.05,
            input_tokens: 20,
            output_tokens: 10,
            cached_tokens: 5,
        });
        tracker.add_usage(UsageReport {
            model: "claude".into(),
            cost: 0.20,
            input_tokens: 200,
            output_tokens: 80,
            cached_tokens: 0,
        });

        let gpt = tracker.usage_for("gpt");
        assert_eq!(gpt.input_tokens, 120);
        assert_eq!(gpt.output_tokens, 60);
        assert_eq!(gpt.call_count, 2);

        let global = tracker.global_usage();
        assert_eq!(global.input_tokens, 320);
        assert!((global.cost - 0.35).abs() < 1e-9);
        assert_eq!(global.call_count, 3);
    }

    #[test]
    fn unknown_model_reports_zeroed_usage() {
        let tracker = CostTracker::new();
        let usage = tracker.usage_for("nonexistent");
        assert_eq!(usage.call_count, 0);
        assert_eq!(usage.input_tokens, 0);
    }
}
