//! The Torch training task: one job directory, one trainer run at a time.
//!
//! A task is split into the persisted [`TrainTaskRecord`] and derived runtime
//! state (labels, snapshot catalog) that is recomputed whenever a record is
//! restored.

use crate::args::training_command;
use crate::classifier::TrainOutputClassifier;
use crate::config::TrainerConfig;
use crate::dataset::DatasetJob;
use crate::error::{TrainingError, TrainingResult};
use crate::inference::{InferenceController, InferenceReport, PredictionEntry};
use crate::job::{TrainTaskConfig, TrainingJobId};
use crate::layout::{read_traceback, RunLog, TaskLayout};
use crate::log_line::parse_line;
use crate::metrics::TrainingMetrics;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::run::TrainingRun;
use crate::snapshots::{SnapshotCatalog, SnapshotEntry};
use crate::supervisor::{LineDisposition, LineHandler, ProcessSupervisor, RunOutcome};
use crate::trainer::{Trainer, TrainerStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything about a task that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainTaskRecord {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    pub config: TrainTaskConfig,
    pub status: TrainerStatus,
    #[serde(default)]
    pub current_epoch: f64,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub metrics: TrainingMetrics,
}

/// State rebuilt from the record and the job directory.
#[derive(Debug)]
struct TaskRuntime {
    layout: TaskLayout,
    labels: Option<Vec<String>>,
    catalog: SnapshotCatalog,
}

impl TaskRuntime {
    fn derive(config: &TrainTaskConfig) -> TrainingResult<Self> {
        let labels = match &config.dataset {
            DatasetJob::ImageClassification(dataset) => match dataset.load_labels() {
                Ok(labels) => Some(labels),
                Err(e) => {
                    debug!(error = %e, "Labels not available");
                    None
                }
            },
            DatasetJob::Generic { .. } => None,
        };

        Ok(Self {
            layout: TaskLayout::new(config.job_dir.clone()),
            labels,
            catalog: SnapshotCatalog::new(&config.job_dir, &config.snapshot_prefix)?,
        })
    }
}

/// A training task driving the `th` trainer.
#[derive(Debug)]
pub struct TorchTrainTask {
    record: TrainTaskRecord,
    runtime: TaskRuntime,
    trainer: TrainerConfig,
    abort: CancellationToken,
}

impl TorchTrainTask {
    /// Creates a fresh task for `config`.
    pub fn new(config: TrainTaskConfig, trainer: TrainerConfig) -> TrainingResult<Self> {
        config.validate()?;
        let record = TrainTaskRecord {
            job_id: TrainingJobId::new(),
            created_at: Utc::now(),
            config,
            status: TrainerStatus::Idle,
            current_epoch: 0.0,
            exception: None,
            traceback: None,
            metrics: TrainingMetrics::default(),
        };
        Self::restore(record, trainer)
    }

    /// Rebuilds a task from its persisted record, rescanning snapshots.
    pub fn restore(record: TrainTaskRecord, trainer: TrainerConfig) -> TrainingResult<Self> {
        let runtime = TaskRuntime::derive(&record.config)?;
        let mut task = Self { record, runtime, trainer, abort: CancellationToken::new() };
        task.detect_snapshots();
        Ok(task)
    }

    /// Loads the task persisted in `job_dir`.
    pub fn load_state(job_dir: &Path, trainer: TrainerConfig) -> TrainingResult<Self> {
        let path = TaskLayout::new(job_dir).state_path();
        let bytes = std::fs::read(&path)
            .map_err(|e| TrainingError::Process(format!("failed to read task state {}: {e}", path.display())))?;
        let record: TrainTaskRecord = serde_json::from_slice(&bytes)?;
        Self::restore(record, trainer)
    }

    pub fn save_state(&self) -> TrainingResult<()> {
        self.runtime.layout.ensure_job_dir()?;
        let json = serde_json::to_string_pretty(&self.record)?;
        std::fs::write(self.runtime.layout.state_path(), json)?;
        Ok(())
    }

    #[must_use]
    pub fn record(&self) -> &TrainTaskRecord {
        &self.record
    }

    #[must_use]
    pub fn config(&self) -> &TrainTaskConfig {
        &self.record.config
    }

    pub fn job_id(&self) -> &TrainingJobId {
        &self.record.job_id
    }

    pub fn job_dir(&self) -> &Path {
        self.runtime.layout.job_dir()
    }

    pub fn name(&self) -> String {
        format!("Train Torch Model ({})", self.record.job_id)
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.runtime.labels.as_deref()
    }

    pub fn label_for(&self, index: usize) -> Option<&str> {
        self.labels().and_then(|labels| labels.get(index)).map(String::as_str)
    }

    pub fn snapshots(&self) -> &[SnapshotEntry] {
        self.runtime.catalog.entries()
    }

    pub fn has_model(&self) -> bool {
        !self.runtime.catalog.is_empty()
    }

    pub fn latest_snapshot(&self) -> Option<&SnapshotEntry> {
        self.runtime.catalog.latest()
    }

    pub fn snapshot_for_epoch(&self, epoch: f64) -> Option<&SnapshotEntry> {
        self.runtime.catalog.for_epoch(epoch)
    }

    /// Rescans the job directory; returns whether any snapshot exists.
    pub fn detect_snapshots(&mut self) -> bool {
        match self.runtime.catalog.refresh() {
            Ok(found) => found,
            Err(e) => {
                warn!(task = %self.name(), error = %e, "Failed to detect snapshots");
                false
            }
        }
    }

    /// Token that aborts the running trainer when cancelled.
    #[must_use]
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn framework_name(&self) -> &'static str {
        "torch"
    }

    pub fn can_view_weights(&self) -> bool {
        false
    }

    pub fn can_infer_one(&self) -> bool {
        matches!(self.record.config.dataset, DatasetJob::ImageClassification(_))
    }

    pub fn can_infer_many(&self) -> bool {
        false
    }

    /// The trainer does not report its snapshot schedule.
    pub fn est_next_snapshot(&self) -> Option<f64> {
        None
    }

    /// Classifies one encoded image with the snapshot at `epoch`, or the
    /// latest snapshot when `epoch` is `None`.
    pub async fn infer_one(&self, image: &[u8], epoch: Option<f64>, abort: CancellationToken) -> InferenceReport {
        if !self.can_infer_one() {
            let message = TrainingError::Unsupported(self.record.config.dataset.kind().to_string()).to_string();
            return InferenceReport { exception: Some(message), ..InferenceReport::default() };
        }

        let snapshot_epoch = match epoch {
            Some(epoch) => epoch,
            None => match self.latest_snapshot() {
                Some(snapshot) => snapshot.epoch,
                None => {
                    warn!(task = %self.name(), "No snapshot available for inference");
                    return InferenceReport {
                        exception: Some("no snapshot available".to_string()),
                        ..InferenceReport::default()
                    };
                }
            },
        };

        InferenceController::new(&self.trainer, &self.record.config, abort).run(image, snapshot_epoch).await
    }

    pub async fn classify_one(
        &self,
        image: &[u8],
        epoch: Option<f64>,
        abort: CancellationToken,
    ) -> Option<Vec<PredictionEntry>> {
        self.infer_one(image, epoch, abort).await.predictions
    }

    fn before_run(&mut self) -> TrainingResult<RunLog> {
        self.runtime.layout.ensure_job_dir()?;
        self.record.exception = None;
        self.record.traceback = None;
        RunLog::open(&self.runtime.layout.log_path())
    }

    fn after_run(&mut self, outcome: &RunOutcome, run: TrainingRun) {
        self.record.current_epoch = run.current_epoch;
        self.record.metrics = run.metrics;

        match outcome {
            RunOutcome::Completed => {
                info!(task = %self.name(), "Task completed");
                self.record.status = TrainerStatus::Finished;
            }
            RunOutcome::Aborted => {
                info!(task = %self.name(), "Task aborted");
                self.record.status = TrainerStatus::Cancelled;
            }
            RunOutcome::Failed { exit_code, trailing } => {
                let exception = run.exception.unwrap_or_else(|| match exit_code {
                    Some(code) => format!("error code {code}"),
                    None => "terminated by signal".to_string(),
                });
                if !trailing.is_empty() {
                    self.record.traceback = Some(trailing.join("\n"));
                }
                self.after_runtime_error();
                self.record.status = TrainerStatus::Failed(exception.clone());
                self.record.exception = Some(exception);
            }
        }
    }

    /// Replaces the traceback with the tail of the persisted log, when it
    /// has any structured lines.
    fn after_runtime_error(&mut self) {
        let log_path = self.runtime.layout.log_path();
        if let Some(traceback) = read_traceback(&log_path, self.trainer.log_tail_lines) {
            self.record.traceback = Some(traceback);
        }
    }
}

/// Line handler for a training run: persists, parses, then classifies.
struct TrainOutput<'a> {
    log: RunLog,
    classifier: TrainOutputClassifier<'a>,
}

impl LineHandler for TrainOutput<'_> {
    fn handle_line(&mut self, line: &str) -> TrainingResult<LineDisposition> {
        if let Err(e) = self.log.append(line) {
            warn!(error = %e, "Failed to write trainer log");
        }
        let Some(record) = parse_line(line) else {
            return Ok(LineDisposition::Unrecognized);
        };
        self.classifier.classify(&record)?;
        Ok(LineDisposition::Recognized)
    }

    fn exception(&self) -> Option<&str> {
        self.classifier.run().exception.as_deref()
    }

    fn record_exception(&mut self, message: String) {
        self.classifier.record_exception(message);
    }
}

#[async_trait]
impl Trainer for TorchTrainTask {
    fn id(&self) -> &'static str {
        "torch"
    }

    async fn prepare(&mut self) -> TrainingResult<()> {
        self.record.config.validate()?;
        self.record.config.dataset.image_classification()?;
        self.runtime.layout.ensure_job_dir()?;
        self.record.status = TrainerStatus::Preparing;
        Ok(())
    }

    async fn run(&mut self, progress: &dyn ProgressSink) -> TrainingResult<RunOutcome> {
        let command = training_command(&self.trainer, &self.record.config)?;
        let log = self.before_run()?;
        let job_id = self.record.job_id.clone();

        self.record.status = TrainerStatus::Running;
        progress.on_event(ProgressEvent::Started { job_id: job_id.clone() });
        info!(task = %self.name(), "Task started");

        let supervisor = ProcessSupervisor::new(self.trainer.poll_interval(), self.abort.clone());
        let run = TrainingRun::resume(self.record.current_epoch, self.record.metrics.clone());
        let mut output = TrainOutput {
            log,
            classifier: TrainOutputClassifier::new(job_id.clone(), run, &mut self.runtime.catalog, progress),
        };

        let outcome = match supervisor.run(&command, &mut output).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Trainer could not be started");
                output.record_exception(e.to_string());
                RunOutcome::Failed { exit_code: None, trailing: Vec::new() }
            }
        };

        let TrainOutput { log, classifier } = output;
        drop(log);
        let run = classifier.into_run();

        self.after_run(&outcome, run);
        self.detect_snapshots();
        progress.on_event(ProgressEvent::Snapshots { job_id: job_id.clone(), snapshots: self.snapshots().to_vec() });
        progress.on_event(ProgressEvent::Finished { job_id, status: self.record.status.clone() });

        if let Err(e) = self.save_state() {
            warn!(task = %self.name(), error = %e, "Failed to save task state");
        }
        Ok(outcome)
    }

    fn status(&self) -> TrainerStatus {
        self.record.status.clone()
    }

    async fn cancel(&self) -> TrainingResult<()> {
        info!(task = %self.name(), "Abort requested");
        self.abort.cancel();
        Ok(())
    }
}
