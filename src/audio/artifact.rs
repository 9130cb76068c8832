//! Finished recording handed to collaborators.

use std::fmt;
use std::path::Path;

use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Wav,
    Ogg,
}

impl MediaType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Ogg => "audio/ogg",
        }
    }

    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Ogg => "ogg",
        }
    }

    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("ogg") || ext.eq_ignore_ascii_case("opus") => {
                Self::Ogg
            }
            _ => Self::Wav,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Encoded audio of one completed session.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    bytes: Vec<u8>,
    media_type: MediaType,
}

impl AudioArtifact {
    pub fn new(bytes: Vec<u8>, media_type: MediaType) -> Self {
        Self { bytes, media_type }
    }

    /// Read a finished capture file into memory.
    pub async fn read(path: &Path) -> Result<Self, CaptureError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(bytes, MediaType::from_path(path)))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Human readable `HH:MM:SS` form handed to collaborators.
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
    let total = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
