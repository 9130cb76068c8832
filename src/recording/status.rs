//! Recording state types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::StrategyKind;
use crate::error::Degradation;

/// Phase of a recording session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Paused,
    Stopping,
    Stopped,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// Capture resources are held.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Recording | Self::Paused | Self::Stopping)
    }
}

/// Point-in-time view returned by `get_state`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub state: RecordingState,
    pub elapsed: Duration,
    pub strategy: Option<StrategyKind>,
    pub degraded: bool,
    pub degradations: Vec<Degradation>,
}
