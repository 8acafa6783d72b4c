//! Torchline Training
//!
//! Supervision of an external Torch (`th`) trainer:
//! - Launching training and inference runs with derived arguments
//! - Parsing timestamped trainer output into metrics and progress events
//! - Tracking weight snapshots written to the job directory
//! - Persisting task state between runs (`TorchTrainTask`)

pub mod args;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod error;
pub mod inference;
pub mod job;
pub mod layout;
pub mod log_line;
pub mod metrics;
pub mod progress;
pub mod run;
pub mod snapshots;
pub mod supervisor;
pub mod task;
pub mod trainer;

pub use args::{inference_command, training_command};
pub use classifier::TrainOutputClassifier;
pub use config::TrainerConfig;
pub use dataset::{DatasetJob, ImageClassificationDataset};
pub use error::{TrainingError, TrainingResult};
pub use inference::{InferenceController, InferenceOutputClassifier, InferenceReport, PredictionEntry};
pub use job::{LrPolicy, TrainTaskConfig, TrainingJobId};
pub use layout::{read_traceback, RunLog, TaskLayout};
pub use log_line::{parse_line, LogRecord, Severity};
pub use metrics::{MetricEvent, MetricPhase, MetricSeries, TrainingMetrics};
pub use progress::{ChannelProgressSink, ProgressEvent, ProgressSink, StdoutProgressSink};
pub use run::{RunPhase, TrainingRun};
pub use snapshots::{SnapshotCatalog, SnapshotEntry};
pub use supervisor::{LineDisposition, LineHandler, ProcessSupervisor, RunOutcome, TrainerCommand};
pub use task::{TorchTrainTask, TrainTaskRecord};
pub use trainer::{Trainer, TrainerStatus};
