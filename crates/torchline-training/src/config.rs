//! Trainer location and supervision settings.
//!
//! Loaded from TOML with the following precedence (later wins):
//! 1. Defaults
//! 2. Global config file (~/.torchline/config.toml)
//! 3. Local config file (./.torchlinerc)
//! 4. Environment variables (`TORCHLINE_TORCH_ROOT`, `TORCHLINE_SCRIPTS_DIR`)

use crate::error::{TrainingError, TrainingResult};
use crate::supervisor::DEFAULT_POLL_INTERVAL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// `torch_root` value meaning "use `th` from `PATH`".
pub const SYSTEM_TORCH: &str = "SYS";

pub const TORCH_ROOT_ENV: &str = "TORCHLINE_TORCH_ROOT";
pub const SCRIPTS_DIR_ENV: &str = "TORCHLINE_SCRIPTS_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Directory containing the `th` binary, or `SYS`.
    #[serde(default = "default_torch_root")]
    pub torch_root: String,

    /// Directory containing `main.lua` (training) and `test.lua` (inference).
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Upper bound on how long one output read may wait before the abort
    /// token is checked again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Number of parsed log messages kept as traceback after a failure.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Zero-based GPU index; passed to the trainer one-based.
    #[serde(default)]
    pub gpu_id: Option<u32>,
}

fn default_torch_root() -> String {
    SYSTEM_TORCH.to_string()
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("tools").join("torch")
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_log_tail_lines() -> usize {
    20
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            torch_root: default_torch_root(),
            scripts_dir: default_scripts_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            log_tail_lines: default_log_tail_lines(),
            gpu_id: None,
        }
    }
}

/// Partial config as found in one file; unset keys keep earlier values.
#[derive(Debug, Default, Deserialize)]
struct TrainerConfigFile {
    torch_root: Option<String>,
    scripts_dir: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
    log_tail_lines: Option<usize>,
    gpu_id: Option<u32>,
}

impl TrainerConfig {
    /// Path of the `th` interpreter.
    pub fn th_binary(&self) -> PathBuf {
        if self.torch_root == SYSTEM_TORCH {
            PathBuf::from("th")
        } else {
            Path::new(&self.torch_root).join("th")
        }
    }

    pub fn train_script(&self) -> PathBuf {
        self.scripts_dir.join("main.lua")
    }

    pub fn test_script(&self) -> PathBuf {
        self.scripts_dir.join("test.lua")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Load configuration from a TOML file on top of the defaults.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let mut config = Self::default();
        config.merge(&Self::read_file(path)?);
        Ok(config)
    }

    fn read_file(path: &Path) -> TrainingResult<TrainerConfigFile> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TrainingError::Config(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| TrainingError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Get default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".torchline")
            .join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".torchlinerc")
    }

    /// Discover and load configuration files and environment overrides.
    pub fn discover_and_load() -> Self {
        let mut config = Self::default();

        for path in [Self::default_global_path(), Self::default_local_path()] {
            if !path.exists() {
                continue;
            }
            match Self::read_file(&path) {
                Ok(file) => config.merge(&file),
                Err(e) => debug!(error = %e, "Ignoring unreadable trainer config"),
            }
        }

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn merge(&mut self, other: &TrainerConfigFile) {
        if let Some(ref torch_root) = other.torch_root {
            self.torch_root = torch_root.clone();
        }
        if let Some(ref scripts_dir) = other.scripts_dir {
            self.scripts_dir = scripts_dir.clone();
        }
        if let Some(poll_interval_ms) = other.poll_interval_ms {
            self.poll_interval_ms = poll_interval_ms;
        }
        if let Some(log_tail_lines) = other.log_tail_lines {
            self.log_tail_lines = log_tail_lines;
        }
        if other.gpu_id.is_some() {
            self.gpu_id = other.gpu_id;
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(torch_root) = var(TORCH_ROOT_ENV).filter(|v| !v.is_empty()) {
            self.torch_root = torch_root;
        }
        if let Some(scripts_dir) = var(SCRIPTS_DIR_ENV).filter(|v| !v.is_empty()) {
            self.scripts_dir = PathBuf::from(scripts_dir);
        }
    }
}
