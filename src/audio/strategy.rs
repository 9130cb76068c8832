//! Capture strategy selection, wiring and finalization.
//!
//! Combined: microphone and loopback streams are summed in-process into one
//! WAV. DualTrack: microphone is encoded in-process while system audio comes
//! from an external capture process; the two files are merged after stop.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::artifact::AudioArtifact;
use super::audio_source::{AudioSourceHandle, SourceOutput, SourceTag};
use super::external_source::ExternalProcessSource;
use super::local_source::LocalGraphSource;
use crate::backend::{
    resolve_monitor_device, AudioBackend, PlatformCapabilities, RetryPolicy, StreamKind,
    StreamOptions,
};
use crate::error::{CaptureError, Degradation};

pub const COMBINED_FILE: &str = "mixed.wav";
pub const MIC_FILE: &str = "mic.wav";
pub const SYSTEM_FILE: &str = "system.ogg";
pub const MERGED_FILE: &str = "merged.wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Combined,
    DualTrack,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Combined => "combined",
            Self::DualTrack => "dual_track",
        }
    }

    pub fn supports_pause(&self) -> bool {
        matches!(self, Self::Combined)
    }
}

/// Strategy requested by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPreference {
    #[default]
    Auto,
    Combined,
    DualTrack,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub sample_rate: u32,
    pub stream_options: StreamOptions,
    pub stop_grace: Duration,
    pub device_probe: RetryPolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            stream_options: StreamOptions::default(),
            stop_grace: Duration::from_secs(3),
            device_probe: RetryPolicy::default(),
        }
    }
}

/// Handles wired for one session, not yet started.
pub struct CaptureSetup {
    pub kind: StrategyKind,
    pub handles: Vec<Box<dyn AudioSourceHandle>>,
    pub degradations: Vec<Degradation>,
}

/// Result of turning stopped sources into one artifact.
pub struct Finalized {
    pub artifact: Option<AudioArtifact>,
    pub degradations: Vec<Degradation>,
}

pub struct CaptureStrategy;

impl CaptureStrategy {
    pub fn select(preference: StrategyPreference, capabilities: &PlatformCapabilities) -> StrategyKind {
        match preference {
            StrategyPreference::Combined => StrategyKind::Combined,
            StrategyPreference::DualTrack => StrategyKind::DualTrack,
            StrategyPreference::Auto if capabilities.loopback_stream => StrategyKind::Combined,
            StrategyPreference::Auto if capabilities.capture_tool => StrategyKind::DualTrack,
            // Nothing can reach system audio; record the mic through the local graph
            StrategyPreference::Auto => StrategyKind::Combined,
        }
    }

    pub async fn prepare(
        kind: StrategyKind,
        backend: Arc<dyn AudioBackend>,
        capabilities: &PlatformCapabilities,
        session_dir: &Path,
        settings: &CaptureSettings,
    ) -> Result<CaptureSetup, CaptureError> {
        match kind {
            StrategyKind::Combined => {
                Self::prepare_combined(backend, capabilities, session_dir, settings).await
            }
            StrategyKind::DualTrack => {
                Self::prepare_dual_track(backend, capabilities, session_dir, settings).await
            }
        }
    }

    async fn prepare_combined(
        backend: Arc<dyn AudioBackend>,
        capabilities: &PlatformCapabilities,
        session_dir: &Path,
        settings: &CaptureSettings,
    ) -> Result<CaptureSetup, CaptureError> {
        let mut degradations = Vec::new();
        let mic = backend
            .open_stream(
                StreamKind::Microphone,
                settings.sample_rate,
                settings.stream_options,
            )
            .await?;
        let mut inputs = vec![(SourceTag::Mic, mic)];

        if capabilities.loopback_stream {
            match backend
                .open_stream(
                    StreamKind::Loopback,
                    settings.sample_rate,
                    settings.stream_options,
                )
                .await
            {
                Ok(loopback) => inputs.push((SourceTag::System, loopback)),
                Err(e) => {
                    warn!("Loopback stream unavailable ({}), recording mic only", e);
                    degradations.push(Degradation::CaptureUnavailable);
                }
            }
        } else {
            warn!("No loopback stream on this platform, recording mic only");
            degradations.push(Degradation::CaptureUnavailable);
        }

        let graph = LocalGraphSource::new(
            SourceTag::Mic,
            inputs,
            session_dir.join(COMBINED_FILE),
            settings.sample_rate,
        );

        Ok(CaptureSetup {
            kind: StrategyKind::Combined,
            handles: vec![Box::new(graph)],
            degradations,
        })
    }

    async fn prepare_dual_track(
        backend: Arc<dyn AudioBackend>,
        capabilities: &PlatformCapabilities,
        session_dir: &Path,
        settings: &CaptureSettings,
    ) -> Result<CaptureSetup, CaptureError> {
        if !capabilities.capture_tool {
            return Err(CaptureError::BackendUnavailable(
                "system audio capture tool (ffmpeg/pactl)".to_string(),
            ));
        }

        let mut degradations = Vec::new();
        let mic = backend
            .open_stream(
                StreamKind::Microphone,
                settings.sample_rate,
                settings.stream_options,
            )
            .await?;
        let mic_graph = LocalGraphSource::new(
            SourceTag::Mic,
            vec![(SourceTag::Mic, mic)],
            session_dir.join(MIC_FILE),
            settings.sample_rate,
        );
        let mut handles: Vec<Box<dyn AudioSourceHandle>> = vec![Box::new(mic_graph)];

        let probe_backend = Arc::clone(&backend);
        let monitor = settings
            .device_probe
            .run(|attempt| {
                let backend = Arc::clone(&probe_backend);
                async move {
                    let devices = backend.list_sources().await?;
                    resolve_monitor_device(&devices).cloned().ok_or_else(|| {
                        if attempt > 1 {
                            info!("Still no monitor device after {} probes", attempt);
                        }
                        CaptureError::CaptureUnavailable
                    })
                }
            })
            .await;

        match monitor {
            Ok(device) => {
                info!("Using {} for system audio", device.name);
                handles.push(Box::new(ExternalProcessSource::new(
                    backend,
                    device,
                    session_dir.join(SYSTEM_FILE),
                    settings.stop_grace,
                )));
            }
            Err(e) => {
                warn!("No system audio device ({}), recording mic only", e);
                degradations.push(Degradation::CaptureUnavailable);
            }
        }

        Ok(CaptureSetup {
            kind: StrategyKind::DualTrack,
            handles,
            degradations,
        })
    }

    /// Turn stopped source outputs into one artifact.
    ///
    /// Prefers something over nothing: a failed merge falls back to the
    /// microphone file, and an unreadable file falls back to the next one.
    pub async fn finalize(
        backend: &dyn AudioBackend,
        outputs: &[SourceOutput],
        session_dir: &Path,
    ) -> Finalized {
        let mut degradations = Vec::new();
        let usable: Vec<&SourceOutput> = outputs.iter().filter(|o| o.usable).collect();

        let mic = usable.iter().find(|o| o.source == SourceTag::Mic);
        let system = usable.iter().find(|o| o.source == SourceTag::System);

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let (Some(mic), Some(system)) = (mic, system) {
            let merged = session_dir.join(MERGED_FILE);
            match backend.merge(&mic.path, &system.path, &merged).await {
                Ok(()) => candidates.push(merged),
                Err(e) => {
                    warn!("Merge failed, keeping microphone recording only: {}", e);
                    degradations.push(Degradation::MergeFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        candidates.extend(usable.iter().map(|o| o.path.clone()));

        for path in candidates {
            match AudioArtifact::read(&path).await {
                Ok(artifact) if !artifact.is_empty() => {
                    info!(
                        "Artifact ready from {:?} ({} bytes, {})",
                        path,
                        artifact.len(),
                        artifact.media_type()
                    );
                    return Finalized {
                        artifact: Some(artifact),
                        degradations,
                    };
                }
                Ok(_) => warn!("Capture file {:?} is empty", path),
                Err(e) => warn!("Failed to read capture file {:?}: {}", path, e),
            }
        }

        Finalized {
            artifact: None,
            degradations,
        }
    }
}
