use crate::error::TrainingResult;
use crate::progress::ProgressSink;
use crate::supervisor::RunOutcome;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum TrainerStatus {
    Idle,
    Preparing,
    Running,
    Finished,
    Failed(String),
    Cancelled,
}

impl std::fmt::Display for TrainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Preparing => f.write_str("preparing"),
            Self::Running => f.write_str("running"),
            Self::Finished => f.write_str("finished"),
            Self::Failed(message) => write!(f, "failed: {message}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    /// Checks the task can run and acquires its on-disk resources.
    async fn prepare(&mut self) -> TrainingResult<()>;

    /// Runs the trainer to completion, abort or failure.
    ///
    /// Process-level failures are reported through the returned outcome and
    /// [`Trainer::status`]; `Err` is reserved for tasks that cannot start.
    async fn run(&mut self, progress: &dyn ProgressSink) -> TrainingResult<RunOutcome>;

    fn status(&self) -> TrainerStatus;

    /// Requests cooperative cancellation of the running trainer.
    async fn cancel(&self) -> TrainingResult<()>;
}
