//! Error taxonomy for the recording core.
//!
//! `CaptureError` is what the orchestrator and the backend return.
//! `Degradation` records conditions discovered after a session started;
//! those never fail the session, they only describe what was lost.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::audio::SourceTag;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Audio capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("No system audio route found")]
    CaptureUnavailable,

    #[error("Required capture tool not available: {0}")]
    BackendUnavailable(String),

    #[error("Capture process exited early: {0}")]
    ProcessExitedEarly(String),

    #[error("Failed to merge capture files: {0}")]
    MergeFailed(String),

    #[error("Checkpoint is corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("Source does not support pause")]
    PauseUnsupported,

    #[error("Capture backend failed: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Map an I/O error from spawning or opening a capture resource.
    pub fn from_spawn(tool: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::BackendUnavailable(tool.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{tool}: {err}"))
            }
            _ => Self::Backend(format!("{tool}: {err}")),
        }
    }
}

impl From<hound::Error> for CaptureError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => Self::Io(e),
            other => Self::Backend(format!("WAV encoder: {other}")),
        }
    }
}

/// A post-start condition that reduced what the session could capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// No system-audio route; the session records the microphone only.
    CaptureUnavailable,
    /// The external system-audio capture process died mid-session.
    ProcessExitedEarly { reason: String },
    /// A source failed at runtime or while stopping.
    SourceFailed { source: SourceTag, reason: String },
    /// The post-stop merge failed; the artifact is the microphone file alone.
    MergeFailed { reason: String },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CaptureUnavailable => write!(f, "system audio unavailable, microphone only"),
            Self::ProcessExitedEarly { reason } => {
                write!(f, "system audio capture exited early: {reason}")
            }
            Self::SourceFailed { source, reason } => {
                write!(f, "{} source failed: {reason}", source.as_str())
            }
            Self::MergeFailed { reason } => write!(f, "merge failed ({reason}), microphone only"),
        }
    }
}
