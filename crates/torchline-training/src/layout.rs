//! Files a task keeps inside its job directory.

use crate::error::TrainingResult;
use crate::log_line::{parse_line, strip_ansi};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const TORCH_LOG_FILE: &str = "torch_output.log";
pub const TASK_STATE_FILE: &str = "task.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLayout {
    job_dir: PathBuf,
}

impl TaskLayout {
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        Self { job_dir: job_dir.into() }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.job_dir.join(TORCH_LOG_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.job_dir.join(TASK_STATE_FILE)
    }

    pub fn ensure_job_dir(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.job_dir)?;
        Ok(())
    }
}

/// Append-only copy of everything the trainer printed.
///
/// The handle is closed when the value is dropped.
#[derive(Debug)]
pub struct RunLog {
    file: File,
}

impl RunLog {
    pub fn open(path: &Path) -> TrainingResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Appends `line` without color codes and flushes it.
    pub fn append(&mut self, line: &str) -> TrainingResult<()> {
        writeln!(self.file, "{}", strip_ansi(line))?;
        self.file.flush()?;
        Ok(())
    }
}

/// Last `keep` parsed messages of the log at `path`, joined by newlines.
///
/// Only the last `2 * keep` raw lines are considered. Returns `None` when
/// the log is missing or none of those lines carries a log header.
pub fn read_traceback(path: &Path, keep: usize) -> Option<String> {
    let file = File::open(path).ok()?;
    let window = keep.saturating_mul(2).max(1);

    let mut raw = VecDeque::with_capacity(window);
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if raw.len() == window {
            raw.pop_front();
        }
        raw.push_back(line);
    }

    let messages: Vec<String> = raw.iter().filter_map(|line| parse_line(line)).map(|record| record.message).collect();
    if messages.is_empty() {
        return None;
    }
    let start = messages.len().saturating_sub(keep);
    Some(messages[start..].join("\n"))
}
