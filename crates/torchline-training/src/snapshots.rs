//! Discovery of weight snapshots written by the trainer.
//!
//! Snapshots are named `<prefix>_<epoch>[.<fraction>]_Weights.<ext>` and live
//! next to the snapshot prefix inside the job directory. The catalog is
//! rebuilt from a directory listing every time; nothing is diffed.

use crate::error::{TrainingError, TrainingResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A weight snapshot found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    /// Whole epochs for `net_5_Weights.t7`, fractional for `net_2.5_Weights.t7`.
    pub epoch: f64,
}

/// Sorted list of the snapshots of one job.
#[derive(Debug, Clone)]
pub struct SnapshotCatalog {
    dir: PathBuf,
    pattern: Regex,
    entries: Vec<SnapshotEntry>,
}

impl SnapshotCatalog {
    /// Builds an empty catalog for `snapshot_prefix` (relative to `job_dir`).
    ///
    /// Directory components of the prefix select the directory to scan; its
    /// file name is the literal filename prefix.
    pub fn new(job_dir: &Path, snapshot_prefix: &str) -> TrainingResult<Self> {
        let prefix = Path::new(snapshot_prefix);
        let dir = match prefix.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => job_dir.join(parent),
            _ => job_dir.to_path_buf(),
        };
        let base = prefix
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                TrainingError::InvalidSpec(format!("invalid snapshot prefix: {snapshot_prefix}"))
            })?;

        let pattern = Regex::new(&format!(r"^{}_(\d+)\.?(\d*)_Weights\.\w+$", regex::escape(base)))
            .map_err(|e| TrainingError::InvalidSpec(format!("invalid snapshot prefix: {e}")))?;

        Ok(Self { dir, pattern, entries: Vec::new() })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot with the highest epoch.
    pub fn latest(&self) -> Option<&SnapshotEntry> {
        self.entries.last()
    }

    pub fn for_epoch(&self, epoch: f64) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|entry| (entry.epoch - epoch).abs() < f64::EPSILON)
    }

    /// Parses the epoch out of a snapshot file name, if it is one.
    pub fn parse_epoch(&self, file_name: &str) -> Option<f64> {
        let caps = self.pattern.captures(file_name)?;
        let whole = &caps[1];
        let fraction = &caps[2];
        if fraction.is_empty() {
            whole.parse::<u64>().ok().map(|epoch| epoch as f64)
        } else {
            format!("{whole}.{fraction}").parse::<f64>().ok()
        }
    }

    /// Rescans the snapshot directory and replaces the catalog.
    ///
    /// Returns whether at least one snapshot exists. A missing directory is
    /// an empty catalog.
    pub fn refresh(&mut self) -> TrainingResult<bool> {
        let mut found = Vec::new();

        let dir = match std::fs::read_dir(&self.dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.entries = found;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        for entry in dir {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(epoch) = self.parse_epoch(name) {
                found.push(SnapshotEntry { path: entry.path(), epoch });
            }
        }

        found.sort_by(|a, b| a.epoch.total_cmp(&b.epoch));
        debug!(dir = %self.dir.display(), count = found.len(), "Detected snapshots");

        self.entries = found;
        Ok(!self.entries.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_refresh_sorts_by_epoch_and_ignores_other_files() {
        let temp = TempDir::new().unwrap();
        for name in [
            "net_5_Weights.t7",
            "net_2.5_Weights.t7",
            "net_10_Weights.t7",
            "net_3_Optim.t7",
            "other_1_Weights.t7",
            "torch_output.log",
        ] {
            std::fs::write(temp.path().join(name), b"").unwrap();
        }

        let mut catalog = SnapshotCatalog::new(temp.path(), "net").unwrap();
        assert!(catalog.refresh().unwrap());

        let epochs: Vec<f64> = catalog.entries().iter().map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![2.5, 5.0, 10.0]);
        assert_eq!(catalog.latest().unwrap().path, temp.path().join("net_10_Weights.t7"));
        assert_eq!(catalog.for_epoch(2.5).unwrap().path, temp.path().join("net_2.5_Weights.t7"));
        assert!(catalog.for_epoch(3.0).is_none());
    }

    #[test]
    fn test_refresh_replaces_previous_entries() {
        let temp = TempDir::new().unwrap();
        let weights = temp.path().join("snapshot_1_Weights.t7");
        std::fs::write(&weights, b"").unwrap();

        let mut catalog = SnapshotCatalog::new(temp.path(), "snapshot").unwrap();
        assert!(catalog.refresh().unwrap());

        std::fs::remove_file(&weights).unwrap();
        assert!(!catalog.refresh().unwrap());
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_prefix_with_directory_and_missing_dir() {
        let temp = TempDir::new().unwrap();
        let mut catalog = SnapshotCatalog::new(temp.path(), "weights/net").unwrap();
        assert_eq!(catalog.dir(), temp.path().join("weights"));
        assert!(!catalog.refresh().unwrap());

        std::fs::create_dir(temp.path().join("weights")).unwrap();
        std::fs::write(temp.path().join("weights/net_7_Weights.t7"), b"").unwrap();
        assert!(catalog.refresh().unwrap());
        assert_eq!(catalog.latest().unwrap().epoch, 7.0);
    }

    #[test]
    fn test_prefix_is_matched_literally() {
        let temp = TempDir::new().unwrap();
        let catalog = SnapshotCatalog::new(temp.path(), "a.b").unwrap();
        assert_eq!(catalog.parse_epoch("a.b_3_Weights.t7"), Some(3.0));
        assert_eq!(catalog.parse_epoch("axb_3_Weights.t7"), None);
    }
}
