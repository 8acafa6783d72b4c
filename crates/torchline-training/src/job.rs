use crate::dataset::DatasetJob;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub const TORCH_MODEL_FILE: &str = "model.lua";
pub const TORCH_SNAPSHOT_PREFIX: &str = "snapshot";
pub const DEFAULT_TORCH_BATCH_SIZE: u32 = 64;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Learning rate schedule handed to the trainer.
///
/// Each policy carries exactly the parameters the trainer expects for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LrPolicy {
    Fixed,
    Step { gamma: f64, stepsize: f64 },
    /// `stepvalues` is passed through verbatim (comma separated list).
    Multistep { gamma: f64, stepvalues: String },
    Exp { gamma: f64 },
    Inv { gamma: f64, power: f64 },
    Poly { power: f64 },
    Sigmoid { gamma: f64, stepsize: f64 },
}

impl LrPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Step { .. } => "step",
            Self::Multistep { .. } => "multistep",
            Self::Exp { .. } => "exp",
            Self::Inv { .. } => "inv",
            Self::Poly { .. } => "poly",
            Self::Sigmoid { .. } => "sigmoid",
        }
    }

    /// Policy-specific trainer flags, in the order the trainer documents them.
    pub fn arguments(&self) -> Vec<String> {
        match self {
            Self::Fixed => Vec::new(),
            Self::Step { gamma, stepsize } => {
                vec![format!("--gamma={gamma:.6}"), format!("--stepvalues={stepsize:.6}")]
            }
            Self::Multistep { gamma, stepvalues } => {
                vec![format!("--stepvalues={stepvalues}"), format!("--gamma={gamma:.6}")]
            }
            Self::Exp { gamma } => vec![format!("--gamma={gamma:.6}")],
            Self::Inv { gamma, power } => {
                vec![format!("--gamma={gamma:.6}"), format!("--power={power:.6}")]
            }
            Self::Poly { power } => vec![format!("--power={power:.6}")],
            Self::Sigmoid { gamma, stepsize } => {
                vec![format!("--stepvalues={stepsize:.6}"), format!("--gamma={gamma:.6}")]
            }
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        let values = match self {
            Self::Fixed => Vec::new(),
            Self::Step { gamma, stepsize } | Self::Sigmoid { gamma, stepsize } => vec![*gamma, *stepsize],
            Self::Multistep { gamma, stepvalues } => {
                if stepvalues.trim().is_empty() {
                    return Err(TrainingError::InvalidSpec("multistep policy requires stepvalues".to_string()));
                }
                vec![*gamma]
            }
            Self::Exp { gamma } => vec![*gamma],
            Self::Inv { gamma, power } => vec![*gamma, *power],
            Self::Poly { power } => vec![*power],
        };
        if values.iter().any(|v| !v.is_finite()) {
            return Err(TrainingError::InvalidSpec(format!(
                "{} policy parameters must be finite",
                self.name()
            )));
        }
        Ok(())
    }
}

/// Everything the trainer needs to know about one training task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainTaskConfig {
    /// Working directory of the job; also where snapshots are written.
    pub job_dir: PathBuf,
    pub dataset: DatasetJob,
    #[serde(default = "default_network_file")]
    pub network_file: String,
    pub train_epochs: u32,
    /// Falls back to [`DEFAULT_TORCH_BATCH_SIZE`].
    #[serde(default)]
    pub batch_size: Option<u32>,
    pub learning_rate: f64,
    #[serde(default = "default_lr_policy")]
    pub lr_policy: LrPolicy,
    #[serde(default)]
    pub crop_size: Option<u32>,
    #[serde(default = "default_use_mean")]
    pub use_mean: bool,
    #[serde(default = "default_interval")]
    pub snapshot_interval: f64,
    #[serde(default = "default_interval")]
    pub val_interval: f64,
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
}

fn default_network_file() -> String {
    TORCH_MODEL_FILE.to_string()
}

fn default_lr_policy() -> LrPolicy {
    LrPolicy::Fixed
}

fn default_use_mean() -> bool {
    true
}

fn default_interval() -> f64 {
    1.0
}

fn default_snapshot_prefix() -> String {
    TORCH_SNAPSHOT_PREFIX.to_string()
}

impl TrainTaskConfig {
    #[must_use]
    pub fn new(job_dir: PathBuf, dataset: DatasetJob) -> Self {
        Self {
            job_dir,
            dataset,
            network_file: default_network_file(),
            train_epochs: 30,
            batch_size: None,
            learning_rate: 0.01,
            lr_policy: default_lr_policy(),
            crop_size: None,
            use_mean: default_use_mean(),
            snapshot_interval: default_interval(),
            val_interval: default_interval(),
            snapshot_prefix: default_snapshot_prefix(),
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size.unwrap_or(DEFAULT_TORCH_BATCH_SIZE)
    }

    /// Network name without its extension (`model.lua` -> `model`).
    pub fn network_name(&self) -> &str {
        self.network_file.split('.').next().unwrap_or_default()
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.job_dir.as_os_str().is_empty() {
            return Err(TrainingError::InvalidSpec("job_dir is required".to_string()));
        }
        if self.network_name().trim().is_empty() {
            return Err(TrainingError::InvalidSpec("network_file is required".to_string()));
        }
        if self.train_epochs == 0 {
            return Err(TrainingError::InvalidSpec("train_epochs must be >= 1".to_string()));
        }
        if !(self.learning_rate.is_finite()) || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidSpec("learning_rate must be > 0".to_string()));
        }
        if self.batch_size == Some(0) {
            return Err(TrainingError::InvalidSpec("batch_size must be >= 1".to_string()));
        }
        if !(self.snapshot_interval.is_finite()) || self.snapshot_interval <= 0.0 {
            return Err(TrainingError::InvalidSpec("snapshot_interval must be > 0".to_string()));
        }
        if !self.val_interval.is_finite() {
            return Err(TrainingError::InvalidSpec("val_interval must be finite".to_string()));
        }
        if self.snapshot_prefix.trim().is_empty() {
            return Err(TrainingError::InvalidSpec("snapshot_prefix is required".to_string()));
        }
        self.lr_policy.validate()?;
        Ok(())
    }
}
