//! Boundary to the operating system's audio stack.
//!
//! The recording core only talks to `AudioBackend`. `NativeBackend` is the
//! PulseAudio/PipeWire implementation (cpal streams, `pactl`, `ffmpeg`).

pub mod cpal_stream;
pub mod devices;
pub mod ffmpeg;
pub mod native;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::CaptureError;

pub use devices::{resolve_monitor_device, AudioDevice};
pub use native::NativeBackend;
pub use retry::RetryPolicy;

/// What the current platform can do, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    pub platform: String,
    /// System audio is available as a regular capturable stream.
    pub loopback_stream: bool,
    /// An external capture tool is installed.
    pub capture_tool: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Microphone,
    Loopback,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::Loopback => "loopback",
        }
    }
}

/// Flags forwarded untouched to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

#[derive(Debug, Clone)]
pub enum PcmEvent {
    /// Mono samples at the stream's sample rate.
    Chunk(Vec<f32>),
    /// Non-fatal stream error reported by the device layer.
    Error(String),
}

/// A local PCM input stream. Opened paused; `play` starts delivery.
///
/// Closing the stream drops its sender, which ends the chunk channel.
pub trait PcmStream: Send {
    fn sample_rate(&self) -> u32;
    fn take_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<PcmEvent>>;
    fn play(&mut self) -> Result<(), CaptureError>;
    fn pause(&mut self) -> Result<(), CaptureError>;
    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// Periodic level reading in dBFS.
    Level(f32),
    /// The process ended; `None` when killed by a signal.
    Exited(Option<i32>),
}

/// How an external capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureExit {
    pub bytes_written: u64,
    /// The grace period elapsed and the process was killed.
    pub forced: bool,
}

/// An OS-level process writing encoded audio straight to a file.
#[async_trait]
pub trait CaptureProcess: Send {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>>;

    /// Ask the process to finish its file, killing it after `grace`.
    async fn terminate(&mut self, grace: Duration) -> Result<CaptureExit, CaptureError>;
}

#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn probe(&self) -> PlatformCapabilities;

    async fn list_sources(&self) -> Result<Vec<AudioDevice>, CaptureError>;

    async fn open_stream(
        &self,
        kind: StreamKind,
        sample_rate: u32,
        options: StreamOptions,
    ) -> Result<Box<dyn PcmStream>, CaptureError>;

    async fn spawn_capture(
        &self,
        device: &AudioDevice,
        output: &Path,
    ) -> Result<Box<dyn CaptureProcess>, CaptureError>;

    /// Mix two files: sum both inputs, duration of the longer one, short
    /// crossfade where the shorter one drops out.
    async fn merge(&self, first: &Path, second: &Path, output: &Path) -> Result<(), CaptureError>;
}
