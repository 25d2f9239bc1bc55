use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use textgen_common::error::{ErrorCategory, TextgenError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// File name of the append-only output log inside the save directory.
pub const OUTPUT_LOG_FILE: &str = "history.jsonl";

/// One completed exchange kept for later auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub prompt: String,
    pub output: String,
    pub base_model: String,
    pub time: DateTime<Utc>,
}

impl OutputRecord {
    pub fn new(
        prompt: impl Into<String>,
        output: impl Into<String>,
        base_model: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            output: output.into(),
            base_model: base_model.into(),
            time: Utc::now(),
        }
    }
}

/// Best-effort sink for completed outputs.
///
/// Callers log failures and carry on; a failed save never fails a generation.
///
/// # Examples
///
/// ```rust
/// use textgen::storage::{FileOutputStore, PersistenceHook};
///
/// let store = FileOutputStore::new("outputs");
/// assert_eq!(store.destination(), std::path::Path::new("outputs"));
/// ```
#[async_trait]
pub trait PersistenceHook: Send + Sync {
    /// Persist one record.
    async fn save(&self, record: &OutputRecord) -> Result<(), StorageError>;

    /// Where records end up, for log messages.
    fn destination(&self) -> &Path;
}

/// Appends records as JSON lines to `history.jsonl` in a directory.
#[derive(Debug)]
pub struct FileOutputStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileOutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_LOG_FILE)
    }

    /// Read back every stored record, oldest first.
    pub async fn records(&self) -> Result<Vec<OutputRecord>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl PersistenceHook for FileOutputStore {
    async fn save(&self, record: &OutputRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(path = %self.log_path().display(), model = %record.base_model, "Saved generation output");
        Ok(())
    }

    fn destination(&self) -> &Path {
        &self.dir
    }
}

/// Errors raised while persisting outputs.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Output storage I/O error: {0}\n💾 Check disk space and permissions of the save directory")]
    Io(#[from] std::io::Error),

    #[error("Output record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TextgenError for StorageError {
    fn category(&self) -> ErrorCategory {
        match self {
            StorageError::Io(_) => ErrorCategory::System,
            StorageError::Serialization(_) => ErrorCategory::Internal,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "STORAGE_IO",
            StorageError::Serialization(_) => "STORAGE_SERIALIZATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_output_store_appends_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileOutputStore::new(temp_dir.path().join("nested"));

        store
            .save(&OutputRecord::new("p1", "o1", "model-a"))
            .await
            .unwrap();
        store
            .save(&OutputRecord::new("p2", "o2", "model-b"))
            .await
            .unwrap();

        let records = store.records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].output, "o1");
        assert_eq!(records[1].base_model, "model-b");
    }

    #[tokio::test]
    async fn test_missing_log_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileOutputStore::new(temp_dir.path());
        assert!(store.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_destination_errors() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        let store = FileOutputStore::new(blocker.join("sub"));
        let err = store
            .save(&OutputRecord::new("p", "o", "m"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(err.category(), ErrorCategory::System);
    }
}
