//! Persistence of the single checkpoint record.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use super::checkpoint::Checkpoint;
use crate::error::CaptureError;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint is corrupt: {0}")]
    Corrupt(String),
}

impl From<CheckpointError> for CaptureError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Io(e) => CaptureError::Io(e),
            CheckpointError::Corrupt(reason) => CaptureError::CheckpointCorrupt(reason),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    async fn clear(&self) -> Result<(), CheckpointError>;
}

fn parse(raw: &str) -> Result<Checkpoint, CheckpointError> {
    serde_json::from_str(raw).map_err(|e| CheckpointError::Corrupt(e.to_string()))
}

fn render(checkpoint: &Checkpoint) -> Result<String, CheckpointError> {
    serde_json::to_string_pretty(checkpoint).map_err(|e| CheckpointError::Corrupt(e.to_string()))
}

/// JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse(&raw).map(Some)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.staging_path();
        tokio::fs::write(&staging, render(checkpoint)?).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        debug!("Checkpoint saved to {:?}", self.path);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store holding the serialized record.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    raw: Mutex<Option<String>>,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with arbitrary contents, valid or not.
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: Mutex::new(Some(raw.into())),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let raw = self.raw.lock().unwrap_or_else(|e| e.into_inner()).clone();
        raw.as_deref().map(parse).transpose()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let rendered = render(checkpoint)?;
        *self.raw.lock().unwrap_or_else(|e| e.into_inner()) = Some(rendered);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        *self.raw.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::StrategyKind;
    use chrono::Utc;

    fn checkpoint(dir: &Path) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(
            Utc::now(),
            "linux",
            StrategyKind::Combined,
            vec![dir.join("mixed.wav")],
        );
        checkpoint.duration_ms = 61_000;
        checkpoint.chunk_count = 42;
        checkpoint
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("recovery").join("checkpoint.json"));
        let saved = checkpoint(dir.path());

        store.save(&saved).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(!store.staging_path().exists());

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        // Clearing twice is fine
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileCheckpointStore::new(&path);
        assert!(matches!(
            store.load().await,
            Err(CheckpointError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load().await.unwrap().is_none());

        let saved = checkpoint(Path::new("/tmp/session-1"));
        store.save(&saved).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(saved));
        assert_eq!(store.save_count(), 1);

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_maps_to_capture_error() {
        let err: CaptureError = CheckpointError::Corrupt("eof".to_string()).into();
        assert!(matches!(err, CaptureError::CheckpointCorrupt(_)));
    }
}
