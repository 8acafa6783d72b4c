use crate::metrics::TrainingMetrics;

/// Where the training output stream currently is.
///
/// `AwaitingSnapshot` is entered on `Snapshotting to ...` and left on the
/// next non-metric line, which is expected to confirm the save. Metric lines
/// arriving in between do not leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    TrainingStep,
    AwaitingSnapshot,
}

impl RunPhase {
    #[must_use]
    pub fn on_progress(self) -> Self {
        match self {
            Self::AwaitingSnapshot => Self::AwaitingSnapshot,
            Self::Idle | Self::TrainingStep => Self::TrainingStep,
        }
    }

    #[must_use]
    pub fn on_snapshot_started(self) -> Self {
        Self::AwaitingSnapshot
    }

    #[must_use]
    pub fn on_snapshot_finished(self) -> Self {
        debug_assert_eq!(self, Self::AwaitingSnapshot, "snapshot finished without a start");
        Self::TrainingStep
    }

    pub fn is_awaiting_snapshot(self) -> bool {
        self == Self::AwaitingSnapshot
    }
}

/// Mutable state of one training run, driven line by line by the classifier.
#[derive(Debug, Clone, Default)]
pub struct TrainingRun {
    pub phase: RunPhase,
    pub current_epoch: f64,
    /// Terminal exception; the first one recorded wins.
    pub exception: Option<String>,
    pub metrics: TrainingMetrics,
}

impl TrainingRun {
    /// Continues from the epoch and metric history of a previous run.
    #[must_use]
    pub fn resume(current_epoch: f64, metrics: TrainingMetrics) -> Self {
        Self { current_epoch, metrics, ..Self::default() }
    }

    /// Records `message` unless an exception is already set.
    pub fn record_exception(&mut self, message: impl Into<String>) -> bool {
        if self.exception.is_some() {
            return false;
        }
        self.exception = Some(message.into());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        let phase = RunPhase::default().on_progress();
        assert_eq!(phase, RunPhase::TrainingStep);

        let phase = phase.on_snapshot_started();
        assert!(phase.is_awaiting_snapshot());
        assert_eq!(phase.on_progress(), RunPhase::AwaitingSnapshot);
        assert_eq!(phase.on_snapshot_finished(), RunPhase::TrainingStep);
    }

    #[test]
    fn test_first_exception_wins() {
        let mut run = TrainingRun::default();
        assert!(run.record_exception("out of memory"));
        assert!(!run.record_exception("error code 1"));
        assert_eq!(run.exception.as_deref(), Some("out of memory"));
    }
}
