//! Audio source abstraction for capturing audio from different inputs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::error::CaptureError;

/// Which side of the meeting a source carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Mic,
    System,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mic => "mic",
            Self::System => "system",
        }
    }
}

/// Live events published by a running source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Latest time-domain buffer written by a local graph.
    Samples { source: SourceTag, samples: Vec<f32> },
    /// Level reported by an external capture process, in dBFS.
    Level { source: SourceTag, decibels: f32 },
    /// The source died after a successful start.
    Failed {
        source: SourceTag,
        reason: String,
        process_exited: bool,
    },
}

/// What a source left on disk once stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOutput {
    pub source: SourceTag,
    pub path: PathBuf,
    pub bytes: u64,
    /// The file is a complete capture that can become the artifact. A local
    /// graph's finalized WAV qualifies even when it holds no samples.
    pub usable: bool,
}

/// Capability set over one captured stream.
///
/// Each handle exclusively owns its OS capture resource (device streams or a
/// child process). `stop` must not return before the handle's output file is
/// fully written.
#[async_trait]
pub trait AudioSourceHandle: Send {
    fn tag(&self) -> SourceTag;

    /// Whether `pause`/`resume` are supported without losing sync or data.
    fn supports_pause(&self) -> bool {
        false
    }

    /// File the source writes incrementally while running.
    fn output_path(&self) -> &Path;

    /// Event receiver; `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SourceEvent>>;

    async fn start(&mut self) -> Result<(), CaptureError>;

    async fn pause(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::PauseUnsupported)
    }

    async fn resume(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::PauseUnsupported)
    }

    async fn stop(&mut self) -> Result<SourceOutput, CaptureError>;
}
