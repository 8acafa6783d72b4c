//! Single-image classification through the trainer's inference entry point.

use crate::args::inference_command;
use crate::classifier::NUMBER_PATTERN;
use crate::config::TrainerConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::job::TrainTaskConfig;
use crate::log_line::{parse_line, LogRecord};
use crate::supervisor::{LineDisposition, LineHandler, ProcessSupervisor, RunOutcome};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static PREDICTION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^Predicted class \d+: (\d+) \(.*?\) ((?i:nan)|{NUMBER_PATTERN})"))
        .expect("prediction regex should be valid")
});

/// One ranked prediction, in the order the trainer printed it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionEntry {
    /// Zero-based index into the labels file.
    pub label: usize,
    pub confidence: f64,
}

/// Collects predictions from inference output.
#[derive(Debug, Default)]
pub struct InferenceOutputClassifier {
    predictions: Vec<PredictionEntry>,
    exception: Option<String>,
    halted: bool,
}

impl InferenceOutputClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predictions(&self) -> &[PredictionEntry] {
        &self.predictions
    }

    #[must_use]
    pub fn into_predictions(self) -> Vec<PredictionEntry> {
        self.predictions
    }

    /// Applies one record. A `nan` confidence is fatal and halts the
    /// classifier; later predictions are ignored.
    pub fn classify(&mut self, record: &LogRecord) -> TrainingResult<()> {
        let message = record.message.as_str();

        if let Some(caps) = PREDICTION_REGEX.captures(message) {
            if self.halted {
                debug!("Ignoring prediction after fatal output: {message}");
                return Ok(());
            }
            let confidence = &caps[2];
            if confidence.eq_ignore_ascii_case("nan") {
                self.halted = true;
                return Err(TrainingError::InvalidMetric(
                    r#"Network reported "nan" for confidence value. Please check image and network"#.to_string(),
                ));
            }
            let (Ok(label), Ok(confidence)) = (caps[1].parse::<usize>(), confidence.parse::<f64>()) else {
                warn!("Unreadable prediction: {message}");
                return Ok(());
            };
            // Trainer labels are one-based.
            let Some(label) = label.checked_sub(1) else {
                warn!("Prediction with label 0 ignored: {message}");
                return Ok(());
            };
            self.predictions.push(PredictionEntry { label, confidence });
            return Ok(());
        }

        if record.severity.is_failure() {
            error!(severity = record.severity.as_str(), "{message}");
            self.record_exception(message.to_string());
        }

        Ok(())
    }
}

impl LineHandler for InferenceOutputClassifier {
    fn handle_line(&mut self, line: &str) -> TrainingResult<LineDisposition> {
        let Some(record) = parse_line(line) else {
            return Ok(LineDisposition::Unrecognized);
        };
        self.classify(&record)?;
        Ok(LineDisposition::Recognized)
    }

    fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    fn record_exception(&mut self, message: String) {
        if self.exception.is_none() {
            self.exception = Some(message);
        }
    }
}

/// What one inference invocation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceReport {
    /// `None` when the trainer was never started or did not complete.
    pub predictions: Option<Vec<PredictionEntry>>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub aborted: bool,
}

/// Runs the trainer's `test.lua` against one input with a fresh supervisor.
#[derive(Debug, Clone)]
pub struct InferenceController<'a> {
    trainer: &'a TrainerConfig,
    task: &'a TrainTaskConfig,
    abort: CancellationToken,
}

impl<'a> InferenceController<'a> {
    pub fn new(trainer: &'a TrainerConfig, task: &'a TrainTaskConfig, abort: CancellationToken) -> Self {
        Self { trainer, task, abort }
    }

    /// Classifies `image` (encoded bytes) with the snapshot at `snapshot_epoch`.
    ///
    /// Every failure, including a trainer that cannot be started, yields
    /// `None`.
    pub async fn classify_one(&self, image: &[u8], snapshot_epoch: f64) -> Option<Vec<PredictionEntry>> {
        self.run(image, snapshot_epoch).await.predictions
    }

    pub async fn run(&self, image: &[u8], snapshot_epoch: f64) -> InferenceReport {
        let mut report = InferenceReport::default();

        // Removed on drop, on every exit path.
        let input = match write_input(image) {
            Ok(file) => file,
            Err(e) => {
                error!(error = %e, "Unable to write inference input");
                report.exception = Some(format!("unable to write inference input: {e}"));
                return report;
            }
        };

        let command = match inference_command(self.trainer, self.task, input.path(), snapshot_epoch) {
            Ok(command) => command,
            Err(e) => {
                report.exception = Some(e.to_string());
                return report;
            }
        };

        info!(job_dir = %self.task.job_dir.display(), snapshot_epoch, "Inference started");
        let supervisor = ProcessSupervisor::new(self.trainer.poll_interval(), self.abort.clone());
        let mut classifier = InferenceOutputClassifier::new();

        match supervisor.run(&command, &mut classifier).await {
            Ok(RunOutcome::Completed) => {
                info!(predictions = classifier.predictions().len(), "Inference completed");
                report.exception = classifier.exception.take();
                report.predictions = Some(classifier.into_predictions());
            }
            Ok(RunOutcome::Aborted) => {
                info!("Inference aborted");
                report.aborted = true;
            }
            Ok(RunOutcome::Failed { exit_code, trailing }) => {
                report.exception = classifier.exception.take().or_else(|| match exit_code {
                    Some(code) => Some(format!("error code {code}")),
                    None => Some("terminated by signal".to_string()),
                });
                if !trailing.is_empty() {
                    report.traceback = Some(trailing.join("\n"));
                }
                error!(exception = ?report.exception, "Inference failed");
            }
            Err(e) => {
                error!(error = %e, "Inference could not be started");
                report.exception = Some(e.to_string());
            }
        }

        report
    }
}

fn write_input(image: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().prefix("torchline-").suffix(".jpeg").tempfile()?;
    file.write_all(image)?;
    file.flush()?;
    Ok(file)
}
