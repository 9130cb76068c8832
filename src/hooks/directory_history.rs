use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use super::{unique_recording_path, HistoryStore};
use crate::audio::{format_elapsed, AudioArtifact};

/// Archives recordings as plain files in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryHistory {
    dir: PathBuf,
}

impl DirectoryHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl HistoryStore for DirectoryHistory {
    async fn archive(&self, artifact: &AudioArtifact, elapsed: Duration) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create recordings directory {:?}", self.dir))?;

        let path = unique_recording_path(&self.dir, artifact.media_type());
        tokio::fs::write(&path, artifact.bytes())
            .await
            .with_context(|| format!("Failed to write recording {:?}", path))?;

        info!(
            "Archived {} recording to {:?}",
            format_elapsed(elapsed),
            path
        );
        Ok(path)
    }
}
