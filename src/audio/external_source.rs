//! System audio captured by an OS-level process writing straight to a file.
//!
//! The process is owned exclusively by this handle. Level readings are
//! forwarded as `SourceEvent::Level`; an exit that was not requested becomes
//! `SourceEvent::Failed` so the session can continue degraded.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::audio_source::{AudioSourceHandle, SourceEvent, SourceOutput, SourceTag};
use crate::backend::{AudioBackend, AudioDevice, CaptureProcess, ProcessEvent};
use crate::error::CaptureError;

pub struct ExternalProcessSource {
    backend: Arc<dyn AudioBackend>,
    device: AudioDevice,
    output_path: PathBuf,
    grace: Duration,
    process: Option<Box<dyn CaptureProcess>>,
    events_tx: mpsc::UnboundedSender<SourceEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SourceEvent>>,
    monitor: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl ExternalProcessSource {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        device: AudioDevice,
        output_path: PathBuf,
        grace: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            device,
            output_path,
            grace,
            process: None,
            events_tx,
            events_rx: Some(events_rx),
            monitor: None,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }
}

#[async_trait]
impl AudioSourceHandle for ExternalProcessSource {
    fn tag(&self) -> SourceTag {
        SourceTag::System
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SourceEvent>> {
        self.events_rx.take()
    }

    async fn start(&mut self) -> Result<(), CaptureError> {
        if self.process.is_some() {
            return Err(CaptureError::Backend(
                "System audio capture already running".to_string(),
            ));
        }

        let mut process = self
            .backend
            .spawn_capture(&self.device, &self.output_path)
            .await?;

        if let Some(mut process_events) = process.take_events() {
            let events = self.events_tx.clone();
            let stopping = Arc::clone(&self.stopping);
            self.monitor = Some(tokio::spawn(async move {
                while let Some(event) = process_events.recv().await {
                    match event {
                        ProcessEvent::Level(decibels) => {
                            let _ = events.send(SourceEvent::Level {
                                source: SourceTag::System,
                                decibels,
                            });
                        }
                        ProcessEvent::Exited(code) => {
                            if !stopping.load(Ordering::SeqCst) {
                                let reason = match code {
                                    Some(code) => format!("exit code {code}"),
                                    None => "terminated".to_string(),
                                };
                                warn!("System audio capture exited early: {}", reason);
                                let _ = events.send(SourceEvent::Failed {
                                    source: SourceTag::System,
                                    reason,
                                    process_exited: true,
                                });
                            }
                            break;
                        }
                    }
                }
            }));
        }

        self.process = Some(process);
        info!(
            "System audio capture running on {} ({})",
            self.device.name, self.device.label
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<SourceOutput, CaptureError> {
        let mut process = self.process.take().ok_or_else(|| {
            CaptureError::Backend("System audio capture not running".to_string())
        })?;

        self.stopping.store(true, Ordering::SeqCst);
        let exit = process.terminate(self.grace).await?;

        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        if exit.forced {
            warn!("System audio capture had to be killed; file may be truncated");
        }
        info!(
            "System audio capture stopped, {} bytes written",
            exit.bytes_written
        );

        Ok(SourceOutput {
            source: SourceTag::System,
            path: self.output_path.clone(),
            bytes: exit.bytes_written,
            usable: exit.bytes_written > 0,
        })
    }
}
