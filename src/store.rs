//! # Persistence
//!
//! Storage seams for operation snapshots and the dead letter queue. The
//! engine only talks to the [`SnapshotStore`] and [`DlqStore`] traits;
//! file-backed JSON implementations are provided for single-node
//! deployments, and tests substitute in-memory fakes.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::dlq::DlqEntry;
use crate::operation::SyncOperation;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable home for operation snapshots, keyed by operation id.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, operation: &SyncOperation) -> Result<(), StoreError>;
    /// `Ok(None)` when no snapshot exists for the id.
    async fn load(&self, id: &str) -> Result<Option<SyncOperation>, StoreError>;
}

/// Durable home for the whole dead letter queue, written as one snapshot.
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn save(&self, entries: &[DlqEntry]) -> Result<(), StoreError>;
    /// `Ok(None)` when nothing has been persisted yet.
    async fn load(&self) -> Result<Option<Vec<DlqEntry>>, StoreError>;
}

fn io_err(path: &std::path::Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Writes each operation to `<dir>/<id>.json`. Writes go through a
/// temporary file and a rename so a crash never leaves a torn snapshot.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, operation: &SyncOperation) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;
        let path = self.path_for(&operation.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(operation)?;
        fs::write(&tmp, body).await.map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| io_err(&path, e))?;
        debug!(id = %operation.id, path = %path.display(), "operation snapshot saved");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SyncOperation>, StoreError> {
        let path = self.path_for(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Persists the queue as a single `dead_letters.json` in the directory.
pub struct FileDlqStore {
    path: PathBuf,
}

impl FileDlqStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("dead_letters.json"),
        }
    }
}

#[async_trait]
impl DlqStore for FileDlqStore {
    async fn save(&self, entries: &[DlqEntry]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(entries)?;
        fs::write(&tmp, body).await.map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_err(&self.path, e))?;
        debug!(entries = entries.len(), path = %self.path.display(), "dead letter snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<DlqEntry>>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&self.path, e)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{DateRange, SyncKind, SyncStatus};
    use chrono::Utc;

    fn range() -> DateRange {
        let today = Utc::now().date_naive();
        DateRange::new(today, today)
    }

    #[tokio::test]
    async fn snapshot_roundtrip_and_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        let mut operation = SyncOperation::new(SyncKind::Full, range());
        operation.status = SyncStatus::Completed;
        operation.progress.processed = 42;
        operation.ended_at = Some(Utc::now());
        store.save(&operation).await.unwrap();

        let loaded = store.load(&operation.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, operation.id);
        assert_eq!(loaded.status, SyncStatus::Completed);
        assert_eq!(loaded.progress.processed, 42);

        assert!(store.load("no-such-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_save_overwrites_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        let mut operation = SyncOperation::new(SyncKind::Incremental, range());
        store.save(&operation).await.unwrap();
        operation.status = SyncStatus::Failed;
        store.save(&operation).await.unwrap();

        let loaded = store.load(&operation.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn dlq_store_returns_none_before_first_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDlqStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());

        store.save(&[]).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().len(), 0);
    }
}
