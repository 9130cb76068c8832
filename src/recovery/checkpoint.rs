use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::StrategyKind;

/// Prefix of per-session temp directories.
pub const SESSION_DIR_PREFIX: &str = "session-";

/// Crash-recovery record for one in-flight session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Session start in epoch milliseconds.
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub platform: String,
    pub strategy: StrategyKind,
    /// Files being written incrementally, microphone first.
    pub temp_file_refs: Vec<PathBuf>,
    pub last_save_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub chunk_count: u64,
    #[serde(default)]
    pub paused: bool,
}

impl Checkpoint {
    pub fn new(
        start_time: DateTime<Utc>,
        platform: impl Into<String>,
        strategy: StrategyKind,
        temp_file_refs: Vec<PathBuf>,
    ) -> Self {
        Self {
            id: start_time.timestamp_millis(),
            start_time,
            platform: platform.into(),
            strategy,
            temp_file_refs,
            last_save_time: start_time,
            duration_ms: 0,
            chunk_count: 0,
            paused: false,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Directory shared by every temp file, when it is a session directory.
    pub fn session_dir(&self) -> Option<PathBuf> {
        let first = self.temp_file_refs.first()?.parent()?;
        let is_session = first
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(SESSION_DIR_PREFIX));
        let shared = self
            .temp_file_refs
            .iter()
            .all(|p| p.parent() == Some(first));
        (is_session && shared).then(|| first.to_path_buf())
    }
}
