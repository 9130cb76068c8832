//! PulseAudio/PipeWire backend.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::cpal_stream::CpalStream;
use super::devices::parse_pactl_sources;
use super::ffmpeg::{self, FfmpegCapture};
use super::{
    AudioBackend, AudioDevice, CaptureProcess, PcmStream, PlatformCapabilities, StreamKind,
    StreamOptions,
};
use crate::error::CaptureError;

const PACTL: &str = "pactl";

#[derive(Debug, Default, Clone)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioBackend for NativeBackend {
    async fn probe(&self) -> PlatformCapabilities {
        let loopback_stream = tokio::task::spawn_blocking(CpalStream::loopback_available)
            .await
            .unwrap_or(false);
        let capabilities = PlatformCapabilities {
            platform: std::env::consts::OS.to_string(),
            loopback_stream,
            capture_tool: ffmpeg::ffmpeg_available() && which::which(PACTL).is_ok(),
        };
        info!("Platform probe: {:?}", capabilities);
        capabilities
    }

    async fn list_sources(&self) -> Result<Vec<AudioDevice>, CaptureError> {
        let output = Command::new(PACTL)
            .args(["list", "sources"])
            .output()
            .await
            .map_err(|e| CaptureError::from_spawn(PACTL, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Backend(format!(
                "pactl list sources failed: {}",
                stderr.trim()
            )));
        }

        let devices = parse_pactl_sources(&String::from_utf8_lossy(&output.stdout));
        debug!("pactl reported {} sources", devices.len());
        Ok(devices)
    }

    async fn open_stream(
        &self,
        kind: StreamKind,
        sample_rate: u32,
        options: StreamOptions,
    ) -> Result<Box<dyn PcmStream>, CaptureError> {
        let stream = tokio::task::spawn_blocking(move || CpalStream::open(kind, sample_rate, options))
            .await
            .map_err(|e| CaptureError::Backend(format!("stream setup task failed: {e}")))??;
        Ok(Box::new(stream))
    }

    async fn spawn_capture(
        &self,
        device: &AudioDevice,
        output: &Path,
    ) -> Result<Box<dyn CaptureProcess>, CaptureError> {
        if !ffmpeg::ffmpeg_available() {
            return Err(CaptureError::BackendUnavailable(ffmpeg::FFMPEG.to_string()));
        }
        Ok(Box::new(FfmpegCapture::spawn(device, output)?))
    }

    async fn merge(&self, first: &Path, second: &Path, output: &Path) -> Result<(), CaptureError> {
        ffmpeg::merge(first, second, output).await
    }
}
