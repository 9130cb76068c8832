//! Startup check for a session that never reached a clean stop.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::checkpoint::Checkpoint;
use super::store::{CheckpointError, CheckpointStore};
use crate::audio::{
    format_elapsed, AudioArtifact, CaptureStrategy, MediaType, SourceOutput, SourceTag,
};
use crate::backend::AudioBackend;
use crate::error::CaptureError;
use crate::hooks::{HistoryStore, TranscriptionSink};

/// Size of a canonical PCM WAV header.
const WAV_HEADER_LEN: u64 = 44;

/// The three ways an unfinished take can be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    TranscribeNow,
    ArchiveAndStartFresh,
    Discard,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [
        Resolution::TranscribeNow,
        Resolution::ArchiveAndStartFresh,
        Resolution::Discard,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::TranscribeNow => "Transcribe it now",
            Self::ArchiveAndStartFresh => "Save it to history without transcribing",
            Self::Discard => "Discard it",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoverySummary {
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub last_save_time: DateTime<Utc>,
    pub file_count: usize,
}

impl fmt::Display for RecoverySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unfinished recording from {} ({} captured, last saved {})",
            self.start_time
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M"),
            format_elapsed(self.elapsed),
            self.last_save_time.with_timezone(&Local).format("%H:%M:%S"),
        )
    }
}

/// A recoverable take found at startup.
#[derive(Debug, Clone)]
pub struct RecoveryOffer {
    checkpoint: Checkpoint,
}

impl RecoveryOffer {
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            start_time: self.checkpoint.start_time,
            elapsed: self.checkpoint.duration(),
            last_save_time: self.checkpoint.last_save_time,
            file_count: self.checkpoint.temp_file_refs.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Transcribed,
    Archived(PathBuf),
    Discarded,
    /// The temp files held no usable audio; everything was cleaned up.
    NothingRecoverable,
}

/// Look for an unfinished session. Invalid leftovers are cleared silently.
pub async fn check_for_recovery(store: &dyn CheckpointStore) -> Option<RecoveryOffer> {
    let checkpoint = match store.load().await {
        Ok(Some(checkpoint)) => checkpoint,
        Ok(None) => return None,
        Err(CheckpointError::Corrupt(reason)) => {
            warn!("{}", CaptureError::CheckpointCorrupt(reason));
            clear_checkpoint(store).await;
            return None;
        }
        Err(e) => {
            warn!("Failed to read recovery checkpoint: {}", e);
            return None;
        }
    };

    if checkpoint.temp_file_refs.is_empty() {
        debug!("Checkpoint references no files, clearing");
        clear_checkpoint(store).await;
        return None;
    }

    for path in &checkpoint.temp_file_refs {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!(
                "Recovery file {:?} is missing, dropping session {}",
                path, checkpoint.id
            );
            remove_temp_files(&checkpoint).await;
            clear_checkpoint(store).await;
            return None;
        }
    }

    info!("Found recoverable session {}", checkpoint.id);
    Some(RecoveryOffer { checkpoint })
}

/// Settle an offer. Temp files and the checkpoint are kept if a collaborator
/// fails, so the offer comes back on the next start.
pub async fn resolve(
    offer: RecoveryOffer,
    resolution: Resolution,
    backend: &dyn AudioBackend,
    store: &dyn CheckpointStore,
    transcription: &dyn TranscriptionSink,
    history: &dyn HistoryStore,
) -> Result<RecoveryOutcome> {
    let checkpoint = offer.checkpoint;
    info!(
        "Resolving session {} with {:?}",
        checkpoint.id, resolution
    );

    if resolution == Resolution::Discard {
        remove_temp_files(&checkpoint).await;
        clear_checkpoint(store).await;
        return Ok(RecoveryOutcome::Discarded);
    }

    let Some(artifact) = recover_artifact(&checkpoint, backend).await else {
        warn!("Session {} held no usable audio", checkpoint.id);
        remove_temp_files(&checkpoint).await;
        clear_checkpoint(store).await;
        return Ok(RecoveryOutcome::NothingRecoverable);
    };

    let elapsed = checkpoint.duration();
    let outcome = match resolution {
        Resolution::TranscribeNow => {
            transcription
                .submit(&artifact, elapsed)
                .await
                .context("Failed to hand recovered recording to transcription")?;
            RecoveryOutcome::Transcribed
        }
        _ => {
            let path = history
                .archive(&artifact, elapsed)
                .await
                .context("Failed to archive recovered recording")?;
            RecoveryOutcome::Archived(path)
        }
    };

    remove_temp_files(&checkpoint).await;
    clear_checkpoint(store).await;
    Ok(outcome)
}

/// Repair headers and turn the referenced files into one artifact.
pub async fn recover_artifact(
    checkpoint: &Checkpoint,
    backend: &dyn AudioBackend,
) -> Option<AudioArtifact> {
    let mut outputs = Vec::new();
    for (index, path) in checkpoint.temp_file_refs.iter().enumerate() {
        let media_type = MediaType::from_path(path);
        if media_type == MediaType::Wav {
            let target = path.clone();
            match tokio::task::spawn_blocking(move || repair_wav_header(&target)).await {
                Ok(Ok(true)) => info!("Repaired WAV header of {:?}", path),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!("Could not repair {:?}: {}", path, e),
                Err(e) => warn!("Header repair task failed: {}", e),
            }
        }

        let bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        let usable = match media_type {
            MediaType::Wav => bytes > WAV_HEADER_LEN,
            MediaType::Ogg => bytes > 0,
        };
        outputs.push(SourceOutput {
            source: if index == 0 {
                SourceTag::Mic
            } else {
                SourceTag::System
            },
            path: path.clone(),
            bytes,
            usable,
        });
    }

    let work_dir = checkpoint
        .temp_file_refs
        .first()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let finalized = CaptureStrategy::finalize(backend, &outputs, &work_dir).await;
    for degradation in &finalized.degradations {
        warn!("Recovery degraded: {}", degradation);
    }
    finalized.artifact
}

/// Rewrite the RIFF and data chunk sizes of a WAV whose writer never
/// finalized. Returns whether anything changed.
pub fn repair_wav_header(path: &Path) -> Result<bool, CaptureError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_len = file.metadata()?.len();

    let mut riff = [0u8; 12];
    if file_len < 12 || file.read_exact(&mut riff).is_err() {
        return Err(CaptureError::Backend("file too short for a WAV header".to_string()));
    }
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
        return Err(CaptureError::Backend("not a RIFF/WAVE file".to_string()));
    }

    let mut block_align: u64 = 1;
    let mut offset: u64 = 12;
    while offset + 8 <= file_len {
        let mut header = [0u8; 8];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut header)?;
        let id = &header[0..4];
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let body = offset + 8;

        if id == b"fmt " && size >= 14 {
            let mut fmt = [0u8; 14];
            file.read_exact(&mut fmt)?;
            block_align = u16::from_le_bytes([fmt[12], fmt[13]]).max(1) as u64;
        }

        if id == b"data" {
            let available = file_len - body;
            let actual = available - available % block_align;
            let riff_size = (body + actual - 8) as u32;
            let stored_riff = u32::from_le_bytes([riff[4], riff[5], riff[6], riff[7]]);

            if size == actual && stored_riff == riff_size {
                return Ok(false);
            }
            file.seek(SeekFrom::Start(offset + 4))?;
            file.write_all(&(actual as u32).to_le_bytes())?;
            file.seek(SeekFrom::Start(4))?;
            file.write_all(&riff_size.to_le_bytes())?;
            file.flush()?;
            debug!(
                "WAV data size {} -> {} bytes in {:?}",
                size, actual, path
            );
            return Ok(true);
        }

        offset = body + size + (size & 1);
    }

    Err(CaptureError::Backend("WAV file has no data chunk".to_string()))
}

async fn remove_temp_files(checkpoint: &Checkpoint) {
    if let Some(dir) = checkpoint.session_dir() {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove session directory {:?}: {}", dir, e);
            }
        }
        return;
    }
    for path in &checkpoint.temp_file_refs {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {:?}: {}", path, e);
            }
        }
    }
}

async fn clear_checkpoint(store: &dyn CheckpointStore) {
    if let Err(e) = store.clear().await {
        warn!("Failed to clear recovery checkpoint: {}", e);
    }
}
