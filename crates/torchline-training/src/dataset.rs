use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const TRAIN_DB: &str = "train_db";
pub const VAL_DB: &str = "val_db";
pub const MEAN_FILE_IMAGE: &str = "mean.jpg";
pub const LABELS_FILE: &str = "labels.txt";

/// The dataset a task trains on.
///
/// Only image classification has trainer support; other kinds are accepted in
/// task configs but fail with [`TrainingError::Unsupported`] when run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetJob {
    ImageClassification(ImageClassificationDataset),
    Generic {
        dir: PathBuf,
    },
}

impl DatasetJob {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ImageClassification(_) => "image classification",
            Self::Generic { .. } => "generic",
        }
    }

    pub fn image_classification(&self) -> TrainingResult<&ImageClassificationDataset> {
        match self {
            Self::ImageClassification(dataset) => Ok(dataset),
            other => Err(TrainingError::Unsupported(other.kind().to_string())),
        }
    }
}

/// An image classification dataset laid out as one directory of databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageClassificationDataset {
    pub dir: PathBuf,
    #[serde(default = "default_train_db")]
    pub train_db: String,
    #[serde(default = "default_val_db")]
    pub val_db: String,
    #[serde(default = "default_mean_file")]
    pub mean_file: String,
    #[serde(default = "default_labels_file")]
    pub labels_file: String,
}

fn default_train_db() -> String {
    TRAIN_DB.to_string()
}

fn default_val_db() -> String {
    VAL_DB.to_string()
}

fn default_mean_file() -> String {
    MEAN_FILE_IMAGE.to_string()
}

fn default_labels_file() -> String {
    LABELS_FILE.to_string()
}

impl ImageClassificationDataset {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            train_db: default_train_db(),
            val_db: default_val_db(),
            mean_file: default_mean_file(),
            labels_file: default_labels_file(),
        }
    }

    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.join(name)
    }

    pub fn train_path(&self) -> PathBuf {
        self.path(&self.train_db)
    }

    pub fn val_path(&self) -> PathBuf {
        self.path(&self.val_db)
    }

    pub fn mean_path(&self) -> PathBuf {
        self.path(&self.mean_file)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.path(&self.labels_file)
    }

    /// Reads the labels file, one label per non-empty line.
    pub fn load_labels(&self) -> TrainingResult<Vec<String>> {
        let path = self.labels_path();
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            TrainingError::Dataset(format!("failed to read labels file {}: {}", path.display(), e))
        })?;

        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generic_dataset_is_unsupported() {
        let dataset = DatasetJob::Generic { dir: PathBuf::from("/data") };
        let err = dataset.image_classification().unwrap_err();
        assert!(matches!(err, TrainingError::Unsupported(_)));
        assert!(err.to_string().contains("generic"));
    }

    #[test]
    fn test_load_labels_skips_blank_lines() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(LABELS_FILE), "cat\n\n dog \nbird\n").unwrap();

        let dataset = ImageClassificationDataset::new(temp.path().to_path_buf());
        assert_eq!(dataset.load_labels().unwrap(), vec!["cat", "dog", "bird"]);
    }

    #[test]
    fn test_dataset_defaults_from_json() {
        let json = r#"{"type": "image_classification", "dir": "/data/mnist"}"#;
        let dataset: DatasetJob = serde_json::from_str(json).unwrap();
        let images = dataset.image_classification().unwrap();
        assert_eq!(images.train_path(), PathBuf::from("/data/mnist/train_db"));
        assert_eq!(images.mean_path(), PathBuf::from("/data/mnist/mean.jpg"));
    }
}
