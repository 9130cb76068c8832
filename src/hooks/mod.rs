//! Collaborators that receive finished recordings.

pub mod directory_history;
pub mod shell_sink;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{AudioArtifact, MediaType};

pub use directory_history::DirectoryHistory;
pub use shell_sink::ShellTranscriptionSink;

/// Environment variable names passed to the transcription command.
pub mod hook_env {
    pub const AUDIO_PATH: &str = "MEETREC_AUDIO_PATH";
    pub const MEDIA_TYPE: &str = "MEETREC_MEDIA_TYPE";
    pub const DURATION_SECONDS: &str = "MEETREC_DURATION_SECONDS";
}

#[async_trait]
pub trait TranscriptionSink: Send + Sync {
    async fn submit(&self, artifact: &AudioArtifact, elapsed: Duration) -> Result<()>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Keep the recording without transcribing; returns where it went.
    async fn archive(&self, artifact: &AudioArtifact, elapsed: Duration) -> Result<PathBuf>;
}

/// Timestamped file name in `dir`, suffixed with a counter on collision.
pub fn unique_recording_path(dir: &Path, media_type: MediaType) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let ext = media_type.extension();
    let path = dir.join(format!("meeting-{}.{}", timestamp, ext));

    if path.exists() {
        for i in 1..1000 {
            let alt_path = dir.join(format!("meeting-{}-{}.{}", timestamp, i, ext));
            if !alt_path.exists() {
                return alt_path;
            }
        }
    }

    path
}
