use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which pass a metric was measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricPhase {
    Train,
    Val,
}

/// One metric value reported by the trainer at a given epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub epoch: f64,
    /// Stable key, e.g. `loss` or `learning_rate`.
    pub name: String,
    /// Layer-style label shown next to the series, e.g. `SoftmaxWithLoss`.
    pub display_name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub display_name: String,
    /// `(epoch, value)` pairs in arrival order.
    pub points: Vec<(f64, f64)>,
}

/// Metric history of a task, kept across runs and persisted with it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    #[serde(default)]
    pub train: BTreeMap<String, MetricSeries>,
    #[serde(default)]
    pub val: BTreeMap<String, MetricSeries>,
}

impl TrainingMetrics {
    pub fn record(&mut self, phase: MetricPhase, event: &MetricEvent) {
        let series = match phase {
            MetricPhase::Train => &mut self.train,
            MetricPhase::Val => &mut self.val,
        };
        let entry = series.entry(event.name.clone()).or_insert_with(|| MetricSeries {
            display_name: event.display_name.clone(),
            points: Vec::new(),
        });
        entry.points.push((event.epoch, event.value));
    }

    /// Most recent value of a metric, if any was reported.
    pub fn last(&self, phase: MetricPhase, name: &str) -> Option<f64> {
        let series = match phase {
            MetricPhase::Train => &self.train,
            MetricPhase::Val => &self.val,
        };
        series.get(name).and_then(|s| s.points.last()).map(|(_, value)| *value)
    }
}
