//! In-process capture graph.
//!
//! One or more PCM input streams are resampled to the target rate, summed
//! sample-for-sample and encoded to a 16-bit WAV file as they arrive. The WAV
//! header is rewritten about once per second of audio so the file stays
//! readable if the process dies.

use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::audio_mixer::{AudioMixer, FrameAligner};
use super::audio_source::{AudioSourceHandle, SourceEvent, SourceOutput, SourceTag};
use crate::backend::{PcmEvent, PcmStream};
use crate::error::CaptureError;

type Writer = WavWriter<BufWriter<File>>;

enum GraphInput {
    Chunk { input: usize, samples: Vec<f32> },
    Error { input: usize, message: String },
    Closed { input: usize },
}

struct GraphContext {
    tag: SourceTag,
    input_tags: Vec<SourceTag>,
    target_rate: u32,
    events: mpsc::UnboundedSender<SourceEvent>,
    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
}

pub struct LocalGraphSource {
    tag: SourceTag,
    inputs: Vec<(SourceTag, Box<dyn PcmStream>)>,
    output_path: PathBuf,
    target_rate: u32,
    events_tx: mpsc::UnboundedSender<SourceEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SourceEvent>>,
    task: Option<JoinHandle<Result<u64, CaptureError>>>,
    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
}

impl LocalGraphSource {
    /// `tag` is how the mixed output is reported to listeners; `inputs` are
    /// the streams summed into it, each tagged with what it carries.
    pub fn new(
        tag: SourceTag,
        inputs: Vec<(SourceTag, Box<dyn PcmStream>)>,
        output_path: PathBuf,
        target_rate: u32,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            tag,
            inputs,
            output_path,
            target_rate,
            events_tx,
            events_rx: Some(events_rx),
            task: None,
            paused: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    async fn close_inputs(&mut self) {
        let inputs = std::mem::take(&mut self.inputs);
        // Closing may join device threads
        let closed = tokio::task::spawn_blocking(move || {
            for (_, mut stream) in inputs {
                stream.close();
            }
        })
        .await;
        if let Err(e) = closed {
            warn!("Failed to close input streams: {}", e);
        }
    }
}

#[async_trait]
impl AudioSourceHandle for LocalGraphSource {
    fn tag(&self) -> SourceTag {
        self.tag
    }

    fn supports_pause(&self) -> bool {
        true
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SourceEvent>> {
        self.events_rx.take()
    }

    async fn start(&mut self) -> Result<(), CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::Backend("Local graph already recording".to_string()));
        }
        if self.inputs.is_empty() {
            return Err(CaptureError::Backend("Local graph has no inputs".to_string()));
        }

        let spec = WavSpec {
            channels: 1,
            sample_rate: self.target_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&self.output_path, spec)?;

        let (merged_tx, merged_rx) = mpsc::unbounded_channel();
        for (input, (_, stream)) in self.inputs.iter_mut().enumerate() {
            let chunks = stream.take_chunks().ok_or_else(|| {
                CaptureError::Backend("Input stream already consumed".to_string())
            })?;
            tokio::spawn(forward_input(
                input,
                stream.sample_rate(),
                self.target_rate,
                chunks,
                merged_tx.clone(),
            ));
        }
        drop(merged_tx);

        let context = GraphContext {
            tag: self.tag,
            input_tags: self.inputs.iter().map(|(tag, _)| *tag).collect(),
            target_rate: self.target_rate,
            events: self.events_tx.clone(),
            paused: Arc::clone(&self.paused),
            stopping: Arc::clone(&self.stopping),
        };
        self.task = Some(tokio::spawn(run_graph(merged_rx, writer, context)));

        let mut failure = None;
        for (tag, stream) in self.inputs.iter_mut() {
            if let Err(e) = stream.play() {
                warn!("Failed to start {} input: {}", tag.as_str(), e);
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            self.stopping.store(true, Ordering::SeqCst);
            self.close_inputs().await;
            if let Some(task) = self.task.take() {
                let _ = task.await;
            }
            return Err(e);
        }

        info!(
            "Local graph recording {} input(s) into {:?}",
            self.inputs.len(),
            self.output_path
        );
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), CaptureError> {
        self.paused.store(true, Ordering::SeqCst);
        for (tag, stream) in self.inputs.iter_mut() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause {} input: {}", tag.as_str(), e);
            }
        }
        debug!("Local graph paused");
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), CaptureError> {
        for (tag, stream) in self.inputs.iter_mut() {
            stream.play().map_err(|e| {
                warn!("Failed to resume {} input: {}", tag.as_str(), e);
                e
            })?;
        }
        self.paused.store(false, Ordering::SeqCst);
        debug!("Local graph resumed");
        Ok(())
    }

    async fn stop(&mut self) -> Result<SourceOutput, CaptureError> {
        let task = self
            .task
            .take()
            .ok_or_else(|| CaptureError::Backend("Local graph not recording".to_string()))?;

        self.stopping.store(true, Ordering::SeqCst);
        self.close_inputs().await;

        // The graph finalizes the WAV once every input has closed
        let frames = task
            .await
            .map_err(|e| CaptureError::Backend(format!("Local graph task failed: {e}")))??;

        let bytes = tokio::fs::metadata(&self.output_path).await?.len();
        info!(
            "Local graph stopped, {} samples written ({} bytes)",
            frames, bytes
        );

        Ok(SourceOutput {
            source: self.tag,
            path: self.output_path.clone(),
            bytes,
            usable: true,
        })
    }
}

async fn forward_input(
    input: usize,
    from_rate: u32,
    to_rate: u32,
    mut chunks: mpsc::UnboundedReceiver<PcmEvent>,
    merged: mpsc::UnboundedSender<GraphInput>,
) {
    while let Some(event) = chunks.recv().await {
        let message = match event {
            PcmEvent::Chunk(samples) => GraphInput::Chunk {
                input,
                samples: AudioMixer::resample(&samples, from_rate, to_rate),
            },
            PcmEvent::Error(message) => GraphInput::Error { input, message },
        };
        if merged.send(message).is_err() {
            return;
        }
    }
    let _ = merged.send(GraphInput::Closed { input });
}

async fn run_graph(
    mut inputs: mpsc::UnboundedReceiver<GraphInput>,
    mut writer: Writer,
    context: GraphContext,
) -> Result<u64, CaptureError> {
    let stall_limit = (context.target_rate / 2) as usize;
    let flush_every = context.target_rate as usize;
    let mut aligner = FrameAligner::new(context.input_tags.len(), stall_limit);
    let mut frames: u64 = 0;
    let mut since_flush = 0usize;

    while let Some(message) = inputs.recv().await {
        match message {
            GraphInput::Chunk { input, samples } => {
                if context.paused.load(Ordering::SeqCst) {
                    continue;
                }
                aligner.push(input, &samples);
            }
            GraphInput::Error { input, message } => {
                warn!(
                    "{} input reported an error: {}",
                    context.input_tags[input].as_str(),
                    message
                );
                continue;
            }
            GraphInput::Closed { input } => {
                aligner.close(input);
                if !context.stopping.load(Ordering::SeqCst) {
                    let source = context.input_tags[input];
                    warn!("{} input ended unexpectedly", source.as_str());
                    let _ = context.events.send(SourceEvent::Failed {
                        source,
                        reason: "input stream ended".to_string(),
                        process_exited: false,
                    });
                }
            }
        }

        while let Some(mixed) = aligner.drain_ready() {
            write_samples(&mut writer, &mixed)?;
            frames += mixed.len() as u64;
            since_flush += mixed.len();
            let _ = context.events.send(SourceEvent::Samples {
                source: context.tag,
                samples: mixed,
            });
        }

        if since_flush >= flush_every {
            writer.flush()?;
            since_flush = 0;
        }
    }

    while let Some(rest) = aligner.drain_all() {
        write_samples(&mut writer, &rest)?;
        frames += rest.len() as u64;
    }
    writer.finalize()?;

    Ok(frames)
}

fn write_samples(writer: &mut Writer, samples: &[f32]) -> Result<(), CaptureError> {
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedStream {
        rate: u32,
        tx: Option<mpsc::UnboundedSender<PcmEvent>>,
        rx: Option<mpsc::UnboundedReceiver<PcmEvent>>,
        playing: Arc<AtomicBool>,
    }

    impl ScriptedStream {
        fn new(rate: u32) -> (Self, mpsc::UnboundedSender<PcmEvent>, Arc<AtomicBool>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let playing = Arc::new(AtomicBool::new(false));
            let stream = Self {
                rate,
                tx: Some(tx.clone()),
                rx: Some(rx),
                playing: Arc::clone(&playing),
            };
            (stream, tx, playing)
        }
    }

    impl PcmStream for ScriptedStream {
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn take_chunks(&mut self) -> Option<mpsc::UnboundedReceiver<PcmEvent>> {
            self.rx.take()
        }
        fn play(&mut self) -> Result<(), CaptureError> {
            self.playing.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn pause(&mut self) -> Result<(), CaptureError> {
            self.playing.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn close(&mut self) {
            self.tx.take();
        }
    }

    #[tokio::test]
    async fn test_single_input_writes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let (stream, tx, playing) = ScriptedStream::new(16000);

        let mut source = LocalGraphSource::new(
            SourceTag::Mic,
            vec![(SourceTag::Mic, Box::new(stream) as Box<dyn PcmStream>)],
            path.clone(),
            16000,
        );
        let mut events = source.take_events().unwrap();
        source.start().await.unwrap();
        assert!(playing.load(Ordering::SeqCst));

        tx.send(PcmEvent::Chunk(vec![0.5; 1600])).unwrap();
        match events.recv().await.unwrap() {
            SourceEvent::Samples { source, samples } => {
                assert_eq!(source, SourceTag::Mic);
                assert_eq!(samples.len(), 1600);
            }
            other => panic!("unexpected event {:?}", other),
        }
        drop(tx);

        let output = source.stop().await.unwrap();
        assert!(output.usable);
        assert_eq!(output.path, path);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.len(), 1600);
    }

    #[tokio::test]
    async fn test_two_inputs_are_summed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.wav");
        let (mic, mic_tx, _) = ScriptedStream::new(16000);
        let (system, system_tx, _) = ScriptedStream::new(16000);

        let mut source = LocalGraphSource::new(
            SourceTag::Mic,
            vec![
                (SourceTag::Mic, Box::new(mic) as Box<dyn PcmStream>),
                (SourceTag::System, Box::new(system) as Box<dyn PcmStream>),
            ],
            path.clone(),
            16000,
        );
        source.start().await.unwrap();

        mic_tx.send(PcmEvent::Chunk(vec![0.25; 100])).unwrap();
        system_tx.send(PcmEvent::Chunk(vec![0.25; 100])).unwrap();
        drop(mic_tx);
        drop(system_tx);

        let output = source.stop().await.unwrap();
        assert!(output.usable);

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 100);
        assert_eq!(samples[0], (0.5 * i16::MAX as f32) as i16);
    }

    #[tokio::test]
    async fn test_samples_dropped_while_paused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let (stream, tx, playing) = ScriptedStream::new(16000);

        let mut source = LocalGraphSource::new(
            SourceTag::Mic,
            vec![(SourceTag::Mic, Box::new(stream) as Box<dyn PcmStream>)],
            path.clone(),
            16000,
        );
        let mut events = source.take_events().unwrap();
        source.start().await.unwrap();

        tx.send(PcmEvent::Chunk(vec![0.1; 10])).unwrap();
        events.recv().await.unwrap();

        source.pause().await.unwrap();
        assert!(!playing.load(Ordering::SeqCst));
        tx.send(PcmEvent::Chunk(vec![0.1; 500])).unwrap();
        drop(tx);

        source.stop().await.unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 10);
    }

    #[tokio::test]
    async fn test_resume_restarts_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let (stream, tx, playing) = ScriptedStream::new(16000);

        let mut source = LocalGraphSource::new(
            SourceTag::Mic,
            vec![(SourceTag::Mic, Box::new(stream) as Box<dyn PcmStream>)],
            dir.path().join("mic.wav"),
            16000,
        );
        assert!(source.supports_pause());
        source.start().await.unwrap();
        source.pause().await.unwrap();
        source.resume().await.unwrap();
        assert!(playing.load(Ordering::SeqCst));
        // The graph finishes once every input channel has closed
        drop(tx);
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_audio_still_finalizes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let (stream, tx, _) = ScriptedStream::new(48000);
        drop(tx);

        let mut source = LocalGraphSource::new(
            SourceTag::Mic,
            vec![(SourceTag::Mic, Box::new(stream) as Box<dyn PcmStream>)],
            path,
            16000,
        );
        source.start().await.unwrap();
        let output = source.stop().await.unwrap();
        // A started graph always leaves a valid, possibly empty, WAV
        assert!(output.usable);
        assert_eq!(output.bytes, 44);
        let reader = hound::WavReader::open(&output.path).unwrap();
        assert_eq!(reader.len(), 0);
    }
}
