use crate::audio::{CaptureSettings, StrategyPreference};
use crate::backend::{RetryPolicy, StreamOptions};
use crate::global;
use crate::recording::OrchestratorOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub recovery: RecoveryConfig,
    pub visualizer: VisualizerConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// auto, combined or dual_track
    pub strategy: StrategyPreference,
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    /// Seconds an external capture process gets to finish its file
    pub stop_grace_seconds: u64,
    pub device_probe_attempts: u32,
    pub device_probe_interval_ms: u64,
    /// Keep per-session temp files after a clean stop
    pub keep_temp_files: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyPreference::Auto,
            sample_rate: 16000, // Whisper optimal
            echo_cancellation: true,
            noise_suppression: true,
            stop_grace_seconds: 3,
            device_probe_attempts: 3,
            device_probe_interval_ms: 500,
            keep_temp_files: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub checkpoint_interval_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    pub bars: usize,
    /// Clamped to 0.15..=0.3
    pub smoothing: f32,
    pub gain: f32,
    pub frame_interval_ms: u64,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            bars: 32,
            smoothing: 0.2,
            gain: 4.0,
            frame_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Shell command run per finished recording.
    /// Receives the audio bytes via stdin.
    /// Env vars: MEETREC_AUDIO_PATH, MEETREC_MEDIA_TYPE, MEETREC_DURATION_SECONDS
    pub transcribe_command: String,
    /// Timeout in seconds for the transcribe_command (default: 3600 = 1 hour)
    pub transcribe_timeout_seconds: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            transcribe_command: String::new(),
            transcribe_timeout_seconds: 3600,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            sample_rate: self.capture.sample_rate.max(8000),
            stream_options: StreamOptions {
                echo_cancellation: self.capture.echo_cancellation,
                noise_suppression: self.capture.noise_suppression,
            },
            stop_grace: Duration::from_secs(self.capture.stop_grace_seconds),
            device_probe: RetryPolicy::new(
                self.capture.device_probe_attempts,
                Duration::from_millis(self.capture.device_probe_interval_ms),
            ),
        }
    }

    pub fn orchestrator_options(&self) -> Result<OrchestratorOptions> {
        Ok(OrchestratorOptions {
            preference: self.capture.strategy,
            capture: self.capture_settings(),
            sessions_dir: global::sessions_dir()?,
            checkpoint_interval: Duration::from_secs(
                self.recovery.checkpoint_interval_seconds.max(1),
            ),
            bar_count: self.visualizer.bars.max(1),
            smoothing: self.visualizer.smoothing,
            gain: self.visualizer.gain,
            frame_interval: Duration::from_millis(self.visualizer.frame_interval_ms.max(10)),
            keep_temp_files: self.capture.keep_temp_files,
        })
    }
}
