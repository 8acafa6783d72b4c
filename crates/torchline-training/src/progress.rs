use crate::job::TrainingJobId;
use crate::metrics::{MetricEvent, MetricPhase};
use crate::snapshots::SnapshotEntry;
use crate::trainer::TrainerStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: TrainingJobId },
    Progress { job_id: TrainingJobId, epoch: f64 },
    Metric { job_id: TrainingJobId, phase: MetricPhase, metric: MetricEvent },
    Snapshots { job_id: TrainingJobId, snapshots: Vec<SnapshotEntry> },
    Finished { job_id: TrainingJobId, status: TrainerStatus },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id } => println!("[train:{job_id}] started"),
            ProgressEvent::Progress { job_id, epoch } => println!("[train:{job_id}] epoch {epoch:.2}"),
            ProgressEvent::Metric { job_id, phase, metric } => {
                let phase = match phase {
                    MetricPhase::Train => "train",
                    MetricPhase::Val => "val",
                };
                println!(
                    "[train:{job_id}] {phase} {} ({}) = {} @ epoch {:.2}",
                    metric.name, metric.display_name, metric.value, metric.epoch
                );
            }
            ProgressEvent::Snapshots { job_id, snapshots } => {
                println!("[train:{job_id}] {} snapshot(s)", snapshots.len());
            }
            ProgressEvent::Finished { job_id, status } => println!("[train:{job_id}] finished: {status}"),
        }
    }
}

/// Forwards events to an async consumer, e.g. a push-notification bridge.
///
/// Events are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}
