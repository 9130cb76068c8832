//! Hands recordings to a user-configured shell command.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{hook_env, unique_recording_path, TranscriptionSink};
use crate::audio::AudioArtifact;

/// Runs `sh -c <command>` per recording.
/// - Writes the artifact to `spool_dir` and passes its path in the environment
/// - Pipes the artifact bytes to stdin
/// - Kills the process on timeout
/// - Non-zero exit is an error, so callers can keep their copy
pub struct ShellTranscriptionSink {
    command: String,
    timeout: Duration,
    spool_dir: PathBuf,
}

impl ShellTranscriptionSink {
    pub fn new(command: String, timeout_seconds: u64, spool_dir: PathBuf) -> Self {
        Self {
            command,
            timeout: Duration::from_secs(timeout_seconds),
            spool_dir,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.command.trim().is_empty()
    }
}

#[async_trait]
impl TranscriptionSink for ShellTranscriptionSink {
    async fn submit(&self, artifact: &AudioArtifact, elapsed: Duration) -> Result<()> {
        if !self.is_configured() {
            bail!("No transcription command configured (hooks.transcribe_command)");
        }

        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.spool_dir))?;
        let audio_path = unique_recording_path(&self.spool_dir, artifact.media_type());
        tokio::fs::write(&audio_path, artifact.bytes())
            .await
            .with_context(|| format!("Failed to write {:?}", audio_path))?;

        info!("Running transcription command: {}", self.command);

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(hook_env::AUDIO_PATH, audio_path.to_string_lossy().as_ref())
            .env(hook_env::MEDIA_TYPE, artifact.media_type().as_str())
            .env(hook_env::DURATION_SECONDS, elapsed.as_secs().to_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn transcription command")?;

        // Feed stdin concurrently so a command that streams to stdout can't stall us
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = artifact.bytes().to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
            });
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow!(
                    "Transcription command timed out after {}s",
                    self.timeout.as_secs()
                )
            })?
            .context("Transcription command failed to run")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            info!("Transcription command stdout: {}", stdout.trim());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Transcription command stderr: {}", stderr.trim());
            bail!("Transcription command exited with {}", output.status);
        }

        info!("Transcription command completed for {:?}", audio_path);
        Ok(())
    }
}
