use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::types::Stage;

/// Aggregated counters for one stage.
#[derive(Serialize, Clone, Debug, PartialEq, Default)]
pub struct StageMetrics {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_processing_secs: f64,
    pub total_usage_units: u64,
    pub total_cost: f64,
}

impl StageMetrics {
    pub fn average_processing_secs(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.total_processing_secs / self.attempted as f64
        }
    }
}

/// Snapshot row including the derived average, for status output.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StageMetricsReport {
    #[serde(flatten)]
    pub metrics: StageMetrics,
    pub average_processing_secs: f64,
}

/// Per-stage attempt counters, processing time and cost.
///
/// Pure aggregation: nothing read from here feeds back into scheduling.
/// Cloning shares the underlying counters.
#[derive(Clone, Debug, Default)]
pub struct MetricsCollector {
    unit_costs: Arc<HashMap<Stage, f64>>,
    stages: Arc<Mutex<BTreeMap<Stage, StageMetrics>>>,
}

impl MetricsCollector {
    /// `unit_costs` prices one usage unit per stage. Stages without an entry cost nothing.
    pub fn new(unit_costs: HashMap<Stage, f64>) -> Self {
        Self {
            unit_costs: Arc::new(unit_costs),
            stages: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn record(&self, stage: Stage, success: bool, duration: Duration, usage_units: u64) {
        let unit_cost = self.unit_costs.get(&stage).copied().unwrap_or(0.0);
        let Ok(mut stages) = self.stages.lock() else {
            return;
        };
        let entry = stages.entry(stage).or_default();
        entry.attempted += 1;
        if success {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
        entry.total_processing_secs += duration.as_secs_f64();
        entry.total_usage_units += usage_units;
        entry.total_cost += usage_units as f64 * unit_cost;
    }

    pub fn stage(&self, stage: Stage) -> StageMetrics {
        self.stages
            .lock()
            .ok()
            .and_then(|stages| stages.get(&stage).cloned())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<Stage, StageMetricsReport> {
        let Ok(stages) = self.stages.lock() else {
            return BTreeMap::new();
        };
        stages
            .iter()
            .map(|(stage, metrics)| {
                (
                    *stage,
                    StageMetricsReport {
                        metrics: metrics.clone(),
                        average_processing_secs: metrics.average_processing_secs(),
                    },
                )
            })
            .collect()
    }

    /// Reset one stage, or every stage when `stage` is `None`.
    pub fn reset(&self, stage: Option<Stage>) {
        let Ok(mut stages) = self.stages.lock() else {
            return;
        };
        match stage {
            Some(stage) => {
                stages.remove(&stage);
            }
            None => stages.clear(),
        }
    }
}
