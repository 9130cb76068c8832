//! Scripted audio backend and collaborators for integration tests.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use meetrec::audio::{AudioArtifact, CaptureSettings};
use meetrec::backend::{
    AudioBackend, AudioDevice, CaptureExit, CaptureProcess, PcmEvent, PcmStream,
    PlatformCapabilities, ProcessEvent, RetryPolicy, StreamKind, StreamOptions,
};
use meetrec::hooks::TranscriptionSink;
use meetrec::recording::OrchestratorOptions;
use meetrec::CaptureError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SAMPLE_RATE: u32 = 16000;
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(100);

/// PCM stream that emits a constant-level chunk every 100ms while playing.
pub struct FakeStream {
    level: f32,
    tx: Option<mpsc::UnboundedSender<PcmEvent>>,
    rx: Option<mpsc::UnboundedReceiver<PcmEvent>>,
    feeder: Option<(CancellationToken, JoinHandle<()>)>,
}

impl FakeStream {
    pub fn new(level: f32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            level,
            tx: Some(tx),
            rx: Some(rx),
            feeder: None,
        }
    }

    fn stop_feeder(&mut self) {
        if let Some((cancel, task)) = self.feeder.take() {
            cancel.cancel();
            task.abort();
        }
    }
}

impl PcmStream for FakeStream {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn take_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<PcmEvent>> {
        self.rx.take()
    }

    fn play(&mut self) -> Result<(), CaptureError> {
        if self.feeder.is_some() {
            return Ok(());
        }
        let tx = self
            .tx
            .clone()
            .ok_or_else(|| CaptureError::Backend("stream closed".to_string()))?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let level = self.level;
        let samples = (SAMPLE_RATE as u64 * CHUNK_INTERVAL.as_millis() as u64 / 1000) as usize;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHUNK_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(PcmEvent::Chunk(vec![level; samples])).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.feeder = Some((cancel, task));
        Ok(())
    }

    fn pause(&mut self) -> Result<(), CaptureError> {
        self.stop_feeder();
        Ok(())
    }

    fn close(&mut self) {
        self.stop_feeder();
        self.tx = None;
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// External capture that writes a placeholder file and reports a level.
pub struct FakeCapture {
    output: PathBuf,
    terminate_delay: Duration,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FakeCapture {
    fn spawn(output: &Path, decibels: f32, script: &CaptureScript) -> Result<Self, CaptureError> {
        if script.writes_file {
            std::fs::write(output, b"OggS fake system capture")?;
        }
        let exit_after = script.exit_after;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(CHUNK_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if exit_after.is_some_and(|after| started.elapsed() >= after) {
                            let _ = tx.send(ProcessEvent::Exited(Some(1)));
                            break;
                        }
                        let _ = tx.send(ProcessEvent::Level(decibels));
                    }
                }
            }
        });
        Ok(Self {
            output: output.to_path_buf(),
            terminate_delay: script.terminate_delay,
            events: Some(rx),
            cancel,
            task: Some(task),
        })
    }
}

#[async_trait]
impl CaptureProcess for FakeCapture {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<CaptureExit, CaptureError> {
        if !self.terminate_delay.is_zero() {
            tokio::time::sleep(self.terminate_delay).await;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let bytes_written = tokio::fs::metadata(&self.output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(CaptureExit {
            bytes_written,
            forced: false,
        })
    }
}

/// How the scripted external capture behaves.
#[derive(Debug, Clone)]
pub struct CaptureScript {
    pub writes_file: bool,
    pub exit_after: Option<Duration>,
    pub terminate_delay: Duration,
}

impl Default for CaptureScript {
    fn default() -> Self {
        Self {
            writes_file: true,
            exit_after: None,
            terminate_delay: Duration::ZERO,
        }
    }
}

pub struct FakeBackend {
    capabilities: PlatformCapabilities,
    devices: Vec<AudioDevice>,
    mic_denied: bool,
    merge_fails: bool,
    capture: CaptureScript,
    level: f32,
    pub merges: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub captures: AtomicUsize,
}

impl FakeBackend {
    fn new(loopback_stream: bool, capture_tool: bool) -> Self {
        Self {
            capabilities: PlatformCapabilities {
                platform: "test".to_string(),
                loopback_stream,
                capture_tool,
            },
            devices: vec![
                AudioDevice::new("alsa_input.pci.analog-stereo", "Built-in Audio Analog Stereo"),
                AudioDevice::new(
                    "alsa_output.pci.analog-stereo.monitor",
                    "Monitor of Built-in Audio Analog Stereo",
                ),
            ],
            mic_denied: false,
            merge_fails: false,
            capture: CaptureScript::default(),
            level: 0.25,
            merges: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
        }
    }

    /// Loopback stream available: auto selects Combined.
    pub fn combined() -> Self {
        Self::new(true, false)
    }

    /// No loopback stream, capture tool present: auto selects DualTrack.
    pub fn dual_track() -> Self {
        Self::new(false, true)
    }

    pub fn without_capture_tool(mut self) -> Self {
        self.capabilities.capture_tool = false;
        self
    }

    pub fn with_devices(mut self, devices: Vec<AudioDevice>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_mic_denied(mut self) -> Self {
        self.mic_denied = true;
        self
    }

    pub fn with_merge_failure(mut self) -> Self {
        self.merge_fails = true;
        self
    }

    pub fn with_capture_exit_after(mut self, after: Duration) -> Self {
        self.capture.exit_after = Some(after);
        self
    }

    /// The capture process dies before creating its output file.
    pub fn with_capture_dying_at_start(mut self) -> Self {
        self.capture.writes_file = false;
        self.capture.exit_after = Some(Duration::ZERO);
        self
    }

    pub fn with_slow_terminate(mut self, delay: Duration) -> Self {
        self.capture.terminate_delay = delay;
        self
    }

    pub fn with_silence(mut self) -> Self {
        self.level = 0.0;
        self
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    async fn probe(&self) -> PlatformCapabilities {
        self.capabilities.clone()
    }

    async fn list_sources(&self) -> Result<Vec<AudioDevice>, CaptureError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.devices.clone())
    }

    async fn open_stream(
        &self,
        kind: StreamKind,
        _sample_rate: u32,
        _options: StreamOptions,
    ) -> Result<Box<dyn PcmStream>, CaptureError> {
        if kind == StreamKind::Microphone && self.mic_denied {
            return Err(CaptureError::PermissionDenied("microphone".to_string()));
        }
        Ok(Box::new(FakeStream::new(self.level)))
    }

    async fn spawn_capture(
        &self,
        _device: &AudioDevice,
        output: &Path,
    ) -> Result<Box<dyn CaptureProcess>, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture::spawn(output, -20.0, &self.capture)?))
    }

    async fn merge(&self, first: &Path, _second: &Path, output: &Path) -> Result<(), CaptureError> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        if self.merge_fails {
            return Err(CaptureError::MergeFailed("simulated amix failure".to_string()));
        }
        tokio::fs::copy(first, output).await?;
        Ok(())
    }
}

/// Orchestrator options rooted in a temp dir, with a fast device probe.
pub fn test_options(root: &Path) -> OrchestratorOptions {
    OrchestratorOptions {
        sessions_dir: root.join("sessions"),
        capture: CaptureSettings {
            sample_rate: SAMPLE_RATE,
            stop_grace: Duration::from_secs(1),
            device_probe: RetryPolicy::new(2, Duration::from_millis(10)),
            ..CaptureSettings::default()
        },
        ..OrchestratorOptions::default()
    }
}

/// Records what it was handed; optionally refuses.
#[derive(Default)]
pub struct RecordingSink {
    pub fail: bool,
    pub received: Mutex<Vec<(usize, Duration)>>,
}

#[async_trait]
impl TranscriptionSink for RecordingSink {
    async fn submit(&self, artifact: &AudioArtifact, elapsed: Duration) -> Result<()> {
        if self.fail {
            bail!("transcription service unavailable");
        }
        self.received
            .lock()
            .unwrap()
            .push((artifact.len(), elapsed));
        Ok(())
    }
}

/// Number of entries left in a directory (0 when it does not exist).
pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
