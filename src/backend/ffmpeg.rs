//! FFmpeg-based system audio capture and post-stop merge.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{AudioDevice, CaptureExit, CaptureProcess, ProcessEvent};
use crate::error::CaptureError;

pub const FFMPEG: &str = "ffmpeg";

/// Check if FFmpeg is available on the system.
pub fn ffmpeg_available() -> bool {
    which::which(FFMPEG).is_ok()
}

/// Build FFmpeg args for capturing a PulseAudio source to Opus.
///
/// The `astats`/`ametadata` pair prints the RMS level of every ~100ms window
/// to stderr, which becomes the process's level event stream.
pub fn build_capture_args(device: &AudioDevice, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-f".to_string(),
        "pulse".to_string(),
        "-i".to_string(),
        device.name.clone(),
        "-af".to_string(),
        "astats=metadata=1:reset=5,ametadata=mode=print:key=lavfi.astats.Overall.RMS_level"
            .to_string(),
        "-ac".to_string(),
        "1".to_string(),
        "-c:a".to_string(),
        "libopus".to_string(),
        "-application".to_string(),
        "voip".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Two-input mix: sum both, last as long as the longer one, 2s dropout fade.
pub fn build_merge_args(first: &Path, second: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-i".to_string(),
        first.to_string_lossy().to_string(),
        "-i".to_string(),
        second.to_string_lossy().to_string(),
        "-filter_complex".to_string(),
        "[0:a][1:a]amix=inputs=2:duration=longest:dropout_transition=2:normalize=0".to_string(),
        "-ac".to_string(),
        "1".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Extract a dB reading from one ffmpeg stderr line, if it carries one.
pub fn parse_level_line(line: &str) -> Option<f32> {
    static LEVEL_RE: OnceLock<Regex> = OnceLock::new();
    let re = LEVEL_RE.get_or_init(|| {
        Regex::new(r"lavfi\.astats\.Overall\.RMS_level=(-?inf|-?[0-9]+(?:\.[0-9]+)?)")
            .expect("valid level regex")
    });
    let value = re.captures(line)?.get(1)?.as_str();
    if value.ends_with("inf") {
        return Some(f32::NEG_INFINITY);
    }
    value.parse().ok()
}

/// Keep a terminal Ctrl-C away from the capture process; only `terminate`
/// may signal it.
#[cfg(unix)]
pub fn isolate_process_group(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
pub fn isolate_process_group(_command: &mut Command) {}

pub struct FfmpegCapture {
    child: Option<Child>,
    output: PathBuf,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    exited: Option<oneshot::Receiver<()>>,
}

impl FfmpegCapture {
    pub fn spawn(device: &AudioDevice, output: &Path) -> Result<Self, CaptureError> {
        let args = build_capture_args(device, output);
        debug!("Spawning ffmpeg capture: {:?}", args);

        let mut command = Command::new(FFMPEG);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process_group(&mut command);
        let mut child = command
            .spawn()
            .map_err(|e| CaptureError::from_spawn(FFMPEG, e))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(db) = parse_level_line(&line) {
                        let _ = events_tx.send(ProcessEvent::Level(db));
                    } else if line.contains("rror") {
                        warn!("ffmpeg: {}", line.trim());
                    }
                }
                // stderr closes when the process exits
                let _ = events_tx.send(ProcessEvent::Exited(None));
                let _ = exited_tx.send(());
            });
        }

        info!(
            "System audio capture started from {} into {:?}",
            device.name, output
        );

        Ok(Self {
            child: Some(child),
            output: output.to_path_buf(),
            events: Some(events_rx),
            exited: Some(exited_rx),
        })
    }

    #[cfg(unix)]
    fn interrupt(child: &Child) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(id) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(id as i32), Signal::SIGINT) {
                warn!("Failed to signal ffmpeg: {}", e);
            }
        }
    }

    #[cfg(not(unix))]
    fn interrupt(_child: &Child) {}
}

#[async_trait]
impl CaptureProcess for FfmpegCapture {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }

    async fn terminate(&mut self, grace: Duration) -> Result<CaptureExit, CaptureError> {
        let mut forced = false;

        if let Some(mut child) = self.child.take() {
            // SIGINT lets ffmpeg write the container trailer
            Self::interrupt(&child);

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!("ffmpeg capture exited: {}", status),
                Ok(Err(e)) => warn!("Failed waiting for ffmpeg: {}", e),
                Err(_) => {
                    warn!(
                        "ffmpeg did not exit within {}s, killing",
                        grace.as_secs_f32()
                    );
                    forced = true;
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill ffmpeg: {}", e);
                    }
                }
            }
        }

        if let Some(exited) = self.exited.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), exited).await;
        }

        let bytes_written = tokio::fs::metadata(&self.output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(CaptureExit {
            bytes_written,
            forced,
        })
    }
}

/// Merge two capture files with ffmpeg's `amix`.
pub async fn merge(first: &Path, second: &Path, output: &Path) -> Result<(), CaptureError> {
    let args = build_merge_args(first, second, output);
    debug!("Merging with ffmpeg: {:?}", args);

    let result = Command::new(FFMPEG)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CaptureError::from_spawn(FFMPEG, e))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(CaptureError::MergeFailed(
            stderr
                .lines()
                .last()
                .unwrap_or("ffmpeg exited with non-zero status")
                .to_string(),
        ));
    }

    let produced = tokio::fs::metadata(output)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false);
    if !produced {
        return Err(CaptureError::MergeFailed(
            "ffmpeg did not produce output file".to_string(),
        ));
    }

    info!("Merged {:?} and {:?} into {:?}", first, second, output);
    Ok(())
}
