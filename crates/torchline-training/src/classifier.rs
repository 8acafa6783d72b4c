//! Classification of training output.
//!
//! Each structured log message is matched against the shapes the trainer
//! prints, in order: training metrics, validation metrics, snapshot
//! confirmation (only while a snapshot is pending), snapshot start, and
//! finally error lines. The first match wins.

use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainingJobId;
use crate::log_line::LogRecord;
use crate::metrics::{MetricEvent, MetricPhase};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::run::TrainingRun;
use crate::snapshots::SnapshotCatalog;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

/// A decimal number or a (signed) infinity as printed by the trainer.
pub(crate) const NUMBER_PATTERN: &str = r"-?(?i:inf)|[-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?";

static TRAINING_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^Training \(epoch (\d+\.?\d*)\): \w*loss\w* = ({NUMBER_PATTERN}), lr = ({NUMBER_PATTERN})"
    ))
    .expect("training metric regex should be valid")
});

static VALIDATION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^Validation \(epoch (\d+\.?\d*)\): \w*loss\w* = ({NUMBER_PATTERN}), accuracy = ({NUMBER_PATTERN})"
    ))
    .expect("validation metric regex should be valid")
});

static SNAPSHOTTING_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Snapshotting to (.*?)\s*$").expect("snapshot regex should be valid")
});

fn is_infinite(token: &str) -> bool {
    token.eq_ignore_ascii_case("inf") || token.eq_ignore_ascii_case("-inf")
}

/// Parses a training metric, rejecting infinities as fatal.
fn finite_training_metric(token: &str, what: &str) -> TrainingResult<f64> {
    if token.eq_ignore_ascii_case("-inf") {
        return Err(TrainingError::InvalidMetric(format!(
            "Network reported -inf for {what}. Try changing your learning rate."
        )));
    }
    if token.eq_ignore_ascii_case("inf") {
        return Err(TrainingError::InvalidMetric(format!(
            "Network reported inf for {what}. Try decreasing your learning rate."
        )));
    }
    token
        .parse::<f64>()
        .map_err(|_| TrainingError::InvalidMetric(format!("Network reported unreadable {what}: {token}")))
}

/// Turns training log records into run state changes and progress events.
pub struct TrainOutputClassifier<'a> {
    job_id: TrainingJobId,
    run: TrainingRun,
    catalog: &'a mut SnapshotCatalog,
    progress: &'a dyn ProgressSink,
}

impl<'a> TrainOutputClassifier<'a> {
    pub fn new(
        job_id: TrainingJobId,
        run: TrainingRun,
        catalog: &'a mut SnapshotCatalog,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self { job_id, run, catalog, progress }
    }

    #[must_use]
    pub fn run(&self) -> &TrainingRun {
        &self.run
    }

    #[must_use]
    pub fn into_run(self) -> TrainingRun {
        self.run
    }

    pub fn record_exception(&mut self, message: impl Into<String>) -> bool {
        self.run.record_exception(message)
    }

    /// Applies one record to the run.
    ///
    /// Only an infinite training loss or learning rate is an error; every
    /// other shape, known or not, is absorbed.
    pub fn classify(&mut self, record: &LogRecord) -> TrainingResult<()> {
        let message = record.message.as_str();

        if let Some(caps) = TRAINING_REGEX.captures(message) {
            let Ok(epoch) = caps[1].parse::<f64>() else {
                warn!(job_id = %self.job_id, "Unreadable epoch in training output: {message}");
                return Ok(());
            };
            let loss = finite_training_metric(&caps[2], "training loss")?;
            let lr = finite_training_metric(&caps[3], "learning rate")?;

            self.send_progress_update(epoch);
            self.save_output(MetricPhase::Train, epoch, "loss", "SoftmaxWithLoss", loss);
            self.save_output(MetricPhase::Train, epoch, "learning_rate", "LearningRate", lr);
            debug!(job_id = %self.job_id, "{message}");
            return Ok(());
        }

        if let Some(caps) = VALIDATION_REGEX.captures(message) {
            let (loss, accuracy) = (&caps[2], &caps[3]);
            if is_infinite(loss) || is_infinite(accuracy) {
                debug!(job_id = %self.job_id, "Dropping non-finite validation metrics: {message}");
                return Ok(());
            }
            let (Ok(epoch), Ok(loss), Ok(accuracy)) =
                (caps[1].parse::<f64>(), loss.parse::<f64>(), accuracy.parse::<f64>())
            else {
                warn!(job_id = %self.job_id, "Unreadable validation output: {message}");
                return Ok(());
            };

            debug!(job_id = %self.job_id, "Network accuracy #{epoch}: {accuracy}");
            self.send_progress_update(epoch);
            self.save_output(MetricPhase::Val, epoch, "loss", "SoftmaxWithLoss", loss);
            self.save_output(MetricPhase::Val, epoch, "accuracy", "Accuracy", accuracy);
            return Ok(());
        }

        if self.run.phase.is_awaiting_snapshot() {
            if message.starts_with("Snapshot saved") {
                info!(job_id = %self.job_id, "Snapshot saved.");
            } else {
                warn!(
                    job_id = %self.job_id,
                    r#"Trainer output format seems to have changed. Expected "Snapshot saved..." after "Snapshotting to...""#
                );
            }
            self.run.phase = self.run.phase.on_snapshot_finished();
            self.detect_snapshots();
            return Ok(());
        }

        if let Some(caps) = SNAPSHOTTING_REGEX.captures(message) {
            debug!(job_id = %self.job_id, path = &caps[1], "Snapshot started");
            self.run.phase = self.run.phase.on_snapshot_started();
            return Ok(());
        }

        if record.severity.is_failure() {
            error!(job_id = %self.job_id, severity = record.severity.as_str(), "{message}");
            self.run.record_exception(message);
        }

        Ok(())
    }

    fn send_progress_update(&mut self, epoch: f64) {
        self.run.current_epoch = epoch;
        self.run.phase = self.run.phase.on_progress();
        self.progress.on_event(ProgressEvent::Progress { job_id: self.job_id.clone(), epoch });
    }

    fn save_output(&mut self, phase: MetricPhase, epoch: f64, name: &str, display_name: &str, value: f64) {
        let metric = MetricEvent {
            epoch,
            name: name.to_string(),
            display_name: display_name.to_string(),
            value,
        };
        self.run.metrics.record(phase, &metric);
        self.progress.on_event(ProgressEvent::Metric { job_id: self.job_id.clone(), phase, metric });
    }

    fn detect_snapshots(&mut self) {
        if let Err(e) = self.catalog.refresh() {
            warn!(job_id = %self.job_id, error = %e, "Failed to detect snapshots");
        }
        self.progress.on_event(ProgressEvent::Snapshots {
            job_id: self.job_id.clone(),
            snapshots: self.catalog.entries().to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_line::{parse_line, Severity};
    use crate::run::RunPhase;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_event(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl RecordingSink {
        fn take(&self) -> Vec<ProgressEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    fn record(message: &str) -> LogRecord {
        LogRecord { timestamp: None, severity: Severity::Info, message: message.to_string() }
    }

    fn job_id() -> TrainingJobId {
        TrainingJobId("job-1".to_string())
    }

    fn metric(phase: MetricPhase, epoch: f64, name: &str, display_name: &str, value: f64) -> ProgressEvent {
        ProgressEvent::Metric {
            job_id: job_id(),
            phase,
            metric: MetricEvent {
                epoch,
                name: name.to_string(),
                display_name: display_name.to_string(),
                value,
            },
        }
    }

    #[test]
    fn test_training_line_emits_progress_and_metrics() {
        let temp = TempDir::new().unwrap();
        let mut catalog = SnapshotCatalog::new(temp.path(), "snapshot").unwrap();
        let sink = RecordingSink::default();
        let mut classifier = TrainOutputClassifier::new(job_id(), TrainingRun::default(), &mut catalog, &sink);

        classifier.classify(&record("Training (epoch 1.5): train_loss = 0.33, lr = 0.001")).unwrap();

        assert_eq!(
            sink.take(),
            vec![
                ProgressEvent::Progress { job_id: job_id(), epoch: 1.5 },
                metric(MetricPhase::Train, 1.5, "loss", "SoftmaxWithLoss", 0.33),
                metric(MetricPhase::Train, 1.5, "learning_rate", "LearningRate", 0.001),
            ]
        );
        let run = classifier.into_run();
        assert_eq!(run.current_epoch, 1.5);
        assert_eq!(run.phase, RunPhase::TrainingStep);
        assert_eq!(run.metrics.last(MetricPhase::Train, "learning_rate"), Some(0.001));
    }

    #[test]
    fn test_colored_line_classifies_like_plain_line() {
        let colored = "\x1b[32m2015-06-01 12:30:45 [INFO ]\x1b[0m \x1b[31mTraining (epoch 2): loss = 0.5, lr = 0.01\x1b[0m";
        let plain = "2015-06-01 12:30:45 [INFO ] Training (epoch 2): loss = 0.5, lr = 0.01";

        let mut outputs = Vec::new();
        for line in [colored, plain] {
            let temp = TempDir::new().unwrap();
            let mut catalog = SnapshotCatalog::new(temp.path(), "snapshot").unwrap();
            let sink = RecordingSink::default();
            let mut classifier = TrainOutputClassifier::new(job_id(), TrainingRun::default(), &mut catalog, &sink);
            classifier.classify(&parse_line(line).unwrap()).unwrap();
            outputs.push(sink.take());
        }

        assert_eq!(outputs[0].len(), 3);
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn test_infinite_training_loss_is_fatal() {
        let temp = TempDir::new().unwrap();
        let mut catalog = SnapshotCatalog::new(temp.path(), "snapshot").unwrap();
        let sink = RecordingSink::default();
        let mut classifier = TrainOutputClassifier::new(job_id(), TrainingRun::default(), &mut catalog, &sink);

        let err = classifier.classify(&record("Training (epoch 1): loss = inf, lr = 0.001")).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidMetric(_)));
        assert!(err.to_string().contains("inf for training loss"));

        let err = classifier.classify(&record("Training (epoch 1): loss = 0.2, lr = -INF")).unwrap_err();
        assert!(err.to_string().contains("-inf for learning rate"));

        assert!(sink.take().is_empty());
        assert_eq!(classifier.run().current_epoch, 0.0);
    }

    #[test]
    fn test_infinite_validation_metrics_are_dropped() {
        let temp = TempDir::new().unwrap();
        let mut catalog = SnapshotCatalog::new(temp.path(), "snapshot").unwrap();
        let sink = RecordingSink::default();
        let mut classifier = TrainOutputClassifier::new(job_id(), TrainingRun::default(), &mut catalog, &sink);

        classifier.classify(&record("Validation (epoch 3): loss = -inf, accuracy = 0.9")).unwrap();
        assert!(sink.take().is_empty());

        classifier.classify(&record("validation (epoch 3): val_loss = 0.4, ACCURACY = 0.9")).unwrap();
        assert_eq!(
            sink.take(),
            vec![
                ProgressEvent::Progress { job_id: job_id(), epoch: 3.0 },
                metric(MetricPhase::Val, 3.0, "loss", "SoftmaxWithLoss", 0.4),
                metric(MetricPhase::Val, 3.0, "accuracy", "Accuracy", 0.9),
            ]
        );
        assert!(classifier.run().exception.is_none());
    }

    #[test]
    fn test_snapshot_lifecycle_refreshes_catalog() {
        let temp = TempDir::new().unwrap();
        let mut catalog = SnapshotCatalog::new(temp.path(), "snapshot").unwrap();
        let sink = RecordingSink::default();
        let mut classifier = TrainOutputClassifier::new(job_id(), TrainingRun::default(), &mut catalog, &sink);

        classifier.classify(&record("Snapshotting to snapshot_1_Weights.t7")).unwrap();
        assert_eq!(classifier.run().phase, RunPhase::AwaitingSnapshot);

        // metrics do not end the pending snapshot
        classifier.classify(&record("Training (epoch 1): loss = 0.5, lr = 0.01")).unwrap();
        assert_eq!(classifier.run().phase, RunPhase::AwaitingSnapshot);
        sink.take();

        std::fs::write(temp.path().join("snapshot_1_Weights.t7"), b"").unwrap();
        classifier.classify(&record("Snapshot saved - snapshot_1_Weights.t7")).unwrap();
        assert_eq!(classifier.run().phase, RunPhase::TrainingStep);

        let events = sink.take();
        assert_eq!(events.len(), 1);
        let ProgressEvent::Snapshots { snapshots, .. } = &events[0] else {
            panic!("expected snapshot update, got {events:?}");
        };
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].epoch, 1.0);
        drop(classifier);
        assert!(!catalog.is_empty());
    }

    #[test]
    fn test_unexpected_snapshot_confirmation_still_clears_state() {
        let temp = TempDir::new().unwrap();
        let mut catalog = SnapshotCatalog::new(temp.path(), "snapshot").unwrap();
        let sink = RecordingSink::default();
        let mut classifier = TrainOutputClassifier::new(job_id(), TrainingRun::default(), &mut catalog, &sink);

        classifier.classify(&record("Snapshotting to snapshot_2_Weights.t7")).unwrap();
        classifier.classify(&record("Weights written")).unwrap();

        assert_ne!(classifier.run().phase, RunPhase::AwaitingSnapshot);
        assert!(matches!(sink.take().as_slice(), [ProgressEvent::Snapshots { .. }]));
    }

    #[test]
    fn test_first_error_line_becomes_exception() {
        let temp = TempDir::new().unwrap();
        let mut catalog = SnapshotCatalog::new(temp.path(), "snapshot").unwrap();
        let sink = RecordingSink::default();
        let mut classifier = TrainOutputClassifier::new(job_id(), TrainingRun::default(), &mut catalog, &sink);

        let mut warning = record("learning rate is high");
        warning.severity = Severity::Warning;
        classifier.classify(&warning).unwrap();
        assert!(classifier.run().exception.is_none());

        let mut first = record("cuda runtime error (2) : out of memory");
        first.severity = Severity::Error;
        classifier.classify(&first).unwrap();

        let mut second = record("training aborted");
        second.severity = Severity::Critical;
        classifier.classify(&second).unwrap();

        assert_eq!(
            classifier.run().exception.as_deref(),
            Some("cuda runtime error (2) : out of memory")
        );
        assert!(sink.take().is_empty());
    }
}
