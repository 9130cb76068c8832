//! Local PCM capture via cpal.
//!
//! cpal streams are not `Send` on every host, so each stream lives on its own
//! thread and is driven through a command channel. Samples leave the device
//! callback through an unbounded tokio channel.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{PcmEvent, PcmStream, StreamKind, StreamOptions};
use crate::audio::audio_mixer::AudioMixer;
use crate::error::CaptureError;

enum StreamCommand {
    Play,
    Pause,
    Close,
}

pub struct CpalStream {
    kind: StreamKind,
    control: std_mpsc::Sender<StreamCommand>,
    chunks: Option<mpsc::UnboundedReceiver<PcmEvent>>,
    sample_rate: u32,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    /// Open the default input (microphone) or the first monitor input (loopback).
    ///
    /// The flags in `options` are informational for cpal hosts; they are logged
    /// so the operator can see what was requested.
    pub fn open(
        kind: StreamKind,
        preferred_rate: u32,
        options: StreamOptions,
    ) -> Result<Self, CaptureError> {
        let (control_tx, control_rx) = std_mpsc::channel::<StreamCommand>();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<PcmEvent>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, CaptureError>>();

        debug!(
            "Opening {} stream (echo_cancellation={}, noise_suppression={})",
            kind.as_str(),
            options.echo_cancellation,
            options.noise_suppression
        );

        let thread = std::thread::Builder::new()
            .name(format!("meetrec-{}", kind.as_str()))
            .spawn(move || run_stream_thread(kind, preferred_rate, chunk_tx, control_rx, ready_tx))?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CaptureError::Backend(format!(
                    "{} stream thread exited during setup",
                    kind.as_str()
                )));
            }
        };

        Ok(Self {
            kind,
            control: control_tx,
            chunks: Some(chunk_rx),
            sample_rate,
            thread: Some(thread),
        })
    }

    /// Whether any cpal input device looks like a monitor of an output.
    pub fn loopback_available() -> bool {
        find_monitor_device().is_some()
    }

    fn send(&self, command: StreamCommand) -> Result<(), CaptureError> {
        self.control.send(command).map_err(|_| {
            CaptureError::Backend(format!("{} stream thread is gone", self.kind.as_str()))
        })
    }
}

impl PcmStream for CpalStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn take_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<PcmEvent>> {
        self.chunks.take()
    }

    fn play(&mut self) -> Result<(), CaptureError> {
        self.send(StreamCommand::Play)
    }

    fn pause(&mut self) -> Result<(), CaptureError> {
        self.send(StreamCommand::Pause)
    }

    fn close(&mut self) {
        let _ = self.control.send(StreamCommand::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("{} stream thread panicked", self.kind.as_str());
            }
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!("Dropping open {} stream, cleaning up", self.kind.as_str());
            self.close();
        }
    }
}

fn find_monitor_device() -> Option<cpal::Device> {
    let host = cpal::default_host();
    for device in host.input_devices().ok()? {
        if let Ok(name) = device.name() {
            let name_lower = name.to_lowercase();
            if name_lower.contains("monitor") || name_lower.contains("loopback") {
                return Some(device);
            }
        }
    }
    None
}

fn select_device(kind: StreamKind) -> Result<cpal::Device, CaptureError> {
    match kind {
        StreamKind::Microphone => cpal::default_host()
            .default_input_device()
            .ok_or_else(|| CaptureError::Backend("No input device available".to_string())),
        StreamKind::Loopback => find_monitor_device().ok_or(CaptureError::CaptureUnavailable),
    }
}

fn build_error(kind: StreamKind, err: cpal::BuildStreamError) -> CaptureError {
    let message = err.to_string();
    if message.to_lowercase().contains("permission") {
        CaptureError::PermissionDenied(format!("{}: {message}", kind.as_str()))
    } else {
        CaptureError::Backend(format!("{} stream: {message}", kind.as_str()))
    }
}

fn run_stream_thread(
    kind: StreamKind,
    preferred_rate: u32,
    chunk_tx: mpsc::UnboundedSender<PcmEvent>,
    control_rx: std_mpsc::Receiver<StreamCommand>,
    ready_tx: std_mpsc::Sender<Result<u32, CaptureError>>,
) {
    let device = match select_device(kind) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let (channels, sample_rate) = match device.default_input_config() {
        Ok(config) => (config.channels(), config.sample_rate().0),
        Err(e) => {
            warn!(
                "No default config for {} device ({}), using {}Hz mono",
                kind.as_str(),
                e,
                preferred_rate
            );
            (1, preferred_rate)
        }
    };

    info!(
        "{} stream using device: {} ({}Hz, {}ch)",
        kind.as_str(),
        device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate,
        channels
    );

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let data_tx = chunk_tx.clone();
    let err_tx = chunk_tx;
    let stream = match device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let _ = data_tx.send(PcmEvent::Chunk(AudioMixer::downmix(data, channels)));
        },
        move |err| {
            error!("{} stream error: {}", kind.as_str(), err);
            let _ = err_tx.send(PcmEvent::Error(err.to_string()));
        },
        None,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(build_error(kind, e)));
            return;
        }
    };

    let _ = ready_tx.send(Ok(sample_rate));

    for command in control_rx {
        let result = match command {
            StreamCommand::Play => stream.play().map_err(|e| e.to_string()),
            StreamCommand::Pause => stream.pause().map_err(|e| e.to_string()),
            StreamCommand::Close => break,
        };
        if let Err(e) = result {
            warn!("{} stream control failed: {}", kind.as_str(), e);
        }
    }

    drop(stream);
    debug!("{} stream closed", kind.as_str());
}
