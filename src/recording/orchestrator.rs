//! Recording lifecycle orchestrator.
//!
//! Owns the session in flight and drives it through
//! idle → recording ⇄ paused → stopping → stopped. Stopped is terminal;
//! another take needs a new orchestrator.
//! Transitions are serialized behind one async mutex; readers
//! (`get_state`, the watch subscriptions) never wait on a transition.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::SessionClock;
use super::status::{RecordingState, StateSnapshot};
use crate::audio::amplitude::{DEFAULT_GAIN, DEFAULT_SMOOTHING};
use crate::audio::{
    AmplitudeFrame, AmplitudeSample, AmplitudeTracker, AudioArtifact, AudioSourceHandle,
    CaptureSettings, CaptureSetup, CaptureStrategy, SourceEvent, StrategyKind, StrategyPreference,
};
use crate::backend::AudioBackend;
use crate::error::{CaptureError, Degradation};
use crate::recovery::{
    Checkpoint, CheckpointHandle, CheckpointStore, Progress, ProgressSource, RecoverySession,
    SESSION_DIR_PREFIX,
};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub preference: StrategyPreference,
    pub capture: CaptureSettings,
    /// Parent of the per-session temp directories.
    pub sessions_dir: PathBuf,
    pub checkpoint_interval: Duration,
    pub bar_count: usize,
    pub smoothing: f32,
    pub gain: f32,
    pub frame_interval: Duration,
    pub keep_temp_files: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            preference: StrategyPreference::Auto,
            capture: CaptureSettings::default(),
            sessions_dir: std::env::temp_dir().join("meetrec").join("sessions"),
            checkpoint_interval: Duration::from_secs(60),
            bar_count: 32,
            smoothing: DEFAULT_SMOOTHING,
            gain: DEFAULT_GAIN,
            frame_interval: Duration::from_millis(50),
            keep_temp_files: false,
        }
    }
}

/// What `stop` hands back when a started source left a readable file.
#[derive(Debug, Clone)]
pub struct StopReport {
    pub artifact: AudioArtifact,
    pub elapsed: Duration,
    pub strategy: StrategyKind,
    pub degradations: Vec<Degradation>,
}

/// Session facts readable without the transition lock.
struct Shared {
    clock: StdMutex<SessionClock>,
    chunks: AtomicU64,
    strategy: StdMutex<Option<StrategyKind>>,
    degradations: StdMutex<Vec<Degradation>>,
    state: watch::Sender<RecordingState>,
    amplitude: watch::Sender<AmplitudeFrame>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn state(&self) -> RecordingState {
        *self.state.borrow()
    }

    fn set_state(&self, state: RecordingState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Recording state {} -> {}", previous.as_str(), state.as_str());
        }
    }

    fn degrade(&self, degradation: Degradation) {
        warn!("Session degraded: {}", degradation);
        lock(&self.degradations).push(degradation);
    }
}

impl ProgressSource for Shared {
    fn progress(&self) -> Progress {
        let clock = lock(&self.clock);
        Progress {
            elapsed: clock.elapsed(Instant::now()),
            chunk_count: self.chunks.load(Ordering::Relaxed),
            paused: clock.is_paused(),
        }
    }
}

struct Sampler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Sampler {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct ActiveSession {
    kind: StrategyKind,
    handles: Vec<Box<dyn AudioSourceHandle>>,
    session_dir: PathBuf,
    recovery: RecoverySession,
    tracker: Arc<StdMutex<AmplitudeTracker>>,
    pumps: Vec<JoinHandle<()>>,
    sampler: Option<Sampler>,
}

impl ActiveSession {
    fn supports_pause(&self) -> bool {
        self.handles.iter().all(|h| h.supports_pause())
    }
}

pub struct RecordingOrchestrator {
    backend: Arc<dyn AudioBackend>,
    store: Arc<dyn CheckpointStore>,
    options: OrchestratorOptions,
    session: Mutex<Option<ActiveSession>>,
    shared: Arc<Shared>,
}

impl RecordingOrchestrator {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        store: Arc<dyn CheckpointStore>,
        options: OrchestratorOptions,
    ) -> Self {
        let (state, _) = watch::channel(RecordingState::Idle);
        let (amplitude, _) = watch::channel(AmplitudeFrame::default());
        Self {
            backend,
            store,
            options,
            session: Mutex::new(None),
            shared: Arc::new(Shared {
                clock: StdMutex::new(SessionClock::default()),
                chunks: AtomicU64::new(0),
                strategy: StdMutex::new(None),
                degradations: StdMutex::new(Vec::new()),
                state,
                amplitude,
            }),
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn get_state(&self) -> StateSnapshot {
        let degradations = lock(&self.shared.degradations).clone();
        StateSnapshot {
            state: self.shared.state(),
            elapsed: lock(&self.shared.clock).elapsed(Instant::now()),
            strategy: *lock(&self.shared.strategy),
            degraded: !degradations.is_empty(),
            degradations,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RecordingState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_amplitude(&self) -> watch::Receiver<AmplitudeFrame> {
        self.shared.amplitude.subscribe()
    }

    /// Acquire capture resources and begin writing temp files.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let mut slot = self.session.lock().await;
        let state = self.shared.state();
        if state != RecordingState::Idle {
            return Err(CaptureError::InvalidTransition {
                action: "start",
                state: state.as_str(),
            });
        }

        let capabilities = self.backend.probe().await;
        let kind = CaptureStrategy::select(self.options.preference, &capabilities);
        let started_at = Utc::now();
        let session_dir = self.options.sessions_dir.join(format!(
            "{}{}",
            SESSION_DIR_PREFIX,
            started_at.timestamp_millis()
        ));
        tokio::fs::create_dir_all(&session_dir).await?;

        let setup = CaptureStrategy::prepare(
            kind,
            Arc::clone(&self.backend),
            &capabilities,
            &session_dir,
            &self.options.capture,
        )
        .await;
        let CaptureSetup {
            kind,
            handles,
            mut degradations,
        } = match setup {
            Ok(setup) => setup,
            Err(e) => {
                error!("Failed to set up {} capture: {}", kind.as_str(), e);
                remove_session_dir(&session_dir).await;
                return Err(e);
            }
        };

        let mut running: Vec<Box<dyn AudioSourceHandle>> = Vec::with_capacity(handles.len());
        for (index, mut handle) in handles.into_iter().enumerate() {
            let started = handle.start().await;
            match started {
                Ok(()) => running.push(handle),
                Err(e) if index > 0 => {
                    warn!("{} source failed to start: {}", handle.tag().as_str(), e);
                    degradations.push(Degradation::SourceFailed {
                        source: handle.tag(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    error!("Microphone failed to start: {}", e);
                    remove_session_dir(&session_dir).await;
                    return Err(e);
                }
            }
        }

        lock(&self.shared.clock).start(Instant::now());
        self.shared.chunks.store(0, Ordering::Relaxed);
        *lock(&self.shared.strategy) = Some(kind);
        *lock(&self.shared.degradations) = Vec::new();
        for degradation in degradations {
            self.shared.degrade(degradation);
        }

        let tracker = Arc::new(StdMutex::new(AmplitudeTracker::new(
            self.options.bar_count,
            self.options.smoothing,
            kind == StrategyKind::DualTrack,
        )));
        let checkpoint = Checkpoint::new(
            started_at,
            capabilities.platform.clone(),
            kind,
            running
                .iter()
                .map(|handle| handle.output_path().to_path_buf())
                .collect(),
        );
        let recovery = RecoverySession::begin(
            Arc::clone(&self.store),
            checkpoint,
            self.options.checkpoint_interval,
            Arc::clone(&self.shared) as Arc<dyn ProgressSource>,
        )
        .await;

        let pumps: Vec<JoinHandle<()>> = running
            .iter_mut()
            .filter_map(|handle| handle.take_events())
            .map(|events| {
                tokio::spawn(pump_events(
                    events,
                    Arc::clone(&self.shared),
                    Arc::clone(&tracker),
                    recovery.handle(),
                    self.options.gain,
                ))
            })
            .collect();

        let sampler = self.spawn_sampler(Arc::clone(&tracker));
        *slot = Some(ActiveSession {
            kind,
            handles: running,
            session_dir,
            recovery,
            tracker,
            pumps,
            sampler: Some(sampler),
        });
        self.shared.set_state(RecordingState::Recording);

        info!(
            "Recording started ({} strategy on {})",
            kind.as_str(),
            capabilities.platform
        );
        Ok(())
    }

    /// Pause every source. A no-op when the strategy cannot pause.
    pub async fn pause(&self) -> Result<(), CaptureError> {
        let mut slot = self.session.lock().await;
        let state = self.shared.state();
        let session = match (state, slot.as_mut()) {
            (RecordingState::Recording, Some(session)) => session,
            _ => {
                return Err(CaptureError::InvalidTransition {
                    action: "pause",
                    state: state.as_str(),
                })
            }
        };

        if !session.supports_pause() {
            warn!(
                "Pause is not supported with the {} strategy; still recording",
                session.kind.as_str()
            );
            return Ok(());
        }

        for index in 0..session.handles.len() {
            let paused = session.handles[index].pause().await;
            if let Err(e) = paused {
                warn!("Failed to pause, resuming sources: {}", e);
                for handle in session.handles[..index].iter_mut() {
                    let _ = handle.resume().await;
                }
                return Err(e);
            }
        }

        lock(&self.shared.clock).pause(Instant::now());
        if let Some(sampler) = session.sampler.take() {
            sampler.stop().await;
        }
        self.shared
            .amplitude
            .send_replace(silent_frame(self.options.bar_count));
        self.shared.set_state(RecordingState::Paused);
        session.recovery.record_state_change().await;

        info!("Recording paused");
        Ok(())
    }

    /// Resume every source and restart amplitude sampling.
    pub async fn resume(&self) -> Result<(), CaptureError> {
        let mut slot = self.session.lock().await;
        let state = self.shared.state();
        let session = match (state, slot.as_mut()) {
            (RecordingState::Paused, Some(session)) => session,
            (RecordingState::Recording, Some(session)) if !session.supports_pause() => {
                warn!(
                    "Resume is not supported with the {} strategy; still recording",
                    session.kind.as_str()
                );
                return Ok(());
            }
            _ => {
                return Err(CaptureError::InvalidTransition {
                    action: "resume",
                    state: state.as_str(),
                })
            }
        };

        for handle in session.handles.iter_mut() {
            handle.resume().await?;
        }

        lock(&self.shared.clock).resume(Instant::now());
        session.sampler = Some(self.spawn_sampler(Arc::clone(&session.tracker)));
        self.shared.set_state(RecordingState::Recording);
        session.recovery.record_state_change().await;

        info!("Recording resumed");
        Ok(())
    }

    /// Stop every source and produce the artifact.
    ///
    /// `None` only when no started source left a readable file. The
    /// checkpoint is cleared once the artifact is in memory, or when there is
    /// definitively nothing to recover; a source that failed to stop keeps
    /// the checkpoint and temp files for startup recovery.
    pub async fn stop(&self) -> Result<Option<StopReport>, CaptureError> {
        let mut slot = self.session.lock().await;
        let state = self.shared.state();
        let mut session = match (state, slot.take()) {
            (RecordingState::Recording | RecordingState::Paused, Some(session)) => session,
            (_, session) => {
                *slot = session;
                return Err(CaptureError::InvalidTransition {
                    action: "stop",
                    state: state.as_str(),
                });
            }
        };

        lock(&self.shared.clock).freeze(Instant::now());
        self.shared.set_state(RecordingState::Stopping);
        if let Some(sampler) = session.sampler.take() {
            sampler.stop().await;
        }

        let mut outputs = Vec::with_capacity(session.handles.len());
        let mut stop_failed = false;
        for handle in session.handles.iter_mut() {
            let stopped = handle.stop().await;
            match stopped {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    stop_failed = true;
                    self.shared.degrade(Degradation::SourceFailed {
                        source: handle.tag(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        let left_files = outputs.iter().any(|o| o.bytes > 0);

        session.handles.clear();
        for pump in session.pumps.drain(..) {
            pump.abort();
        }

        let finalized =
            CaptureStrategy::finalize(self.backend.as_ref(), &outputs, &session.session_dir).await;
        for degradation in finalized.degradations {
            self.shared.degrade(degradation);
        }

        let elapsed = lock(&self.shared.clock).elapsed(Instant::now());
        self.shared
            .amplitude
            .send_replace(silent_frame(self.options.bar_count));

        let report = match finalized.artifact {
            Some(artifact) => {
                session.recovery.finish().await;
                if !self.options.keep_temp_files {
                    remove_session_dir(&session.session_dir).await;
                }
                info!(
                    "Recording stopped after {:.1}s, {} bytes ({})",
                    elapsed.as_secs_f32(),
                    artifact.len(),
                    artifact.media_type()
                );
                Some(StopReport {
                    artifact,
                    elapsed,
                    strategy: session.kind,
                    degradations: lock(&self.shared.degradations).clone(),
                })
            }
            None if stop_failed || left_files => {
                // A source failed to stop or its file could not be read back
                error!(
                    "Could not produce an artifact; keeping {:?} for recovery",
                    session.session_dir
                );
                session.recovery.abandon().await;
                None
            }
            None => {
                warn!("Recording stopped with no captured audio");
                session.recovery.finish().await;
                if !self.options.keep_temp_files {
                    remove_session_dir(&session.session_dir).await;
                }
                None
            }
        };

        self.shared.set_state(RecordingState::Stopped);
        Ok(report)
    }

    fn spawn_sampler(&self, tracker: Arc<StdMutex<AmplitudeTracker>>) -> Sampler {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sampler(
            tracker,
            Arc::clone(&self.shared),
            self.options.frame_interval,
            cancel.clone(),
        ));
        Sampler { cancel, task }
    }
}

fn silent_frame(bar_count: usize) -> AmplitudeFrame {
    AmplitudeFrame {
        bars: vec![0.0; bar_count.max(1)],
        mic: 0.0,
        system: 0.0,
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<SourceEvent>,
    shared: Arc<Shared>,
    tracker: Arc<StdMutex<AmplitudeTracker>>,
    checkpoint: CheckpointHandle,
    gain: f32,
) {
    while let Some(event) = events.recv().await {
        match event {
            SourceEvent::Samples { source, samples } => {
                shared.chunks.fetch_add(1, Ordering::Relaxed);
                let sample = AmplitudeSample::from_buffer(source, &samples, gain, Instant::now());
                lock(&tracker).observe(sample);
            }
            SourceEvent::Level { source, decibels } => {
                let sample = AmplitudeSample::from_decibels(source, decibels, Instant::now());
                lock(&tracker).observe(sample);
            }
            SourceEvent::Failed {
                source,
                reason,
                process_exited,
            } => {
                let degradation = if process_exited {
                    Degradation::ProcessExitedEarly { reason }
                } else {
                    Degradation::SourceFailed { source, reason }
                };
                shared.degrade(degradation);
                checkpoint.prune_missing().await;
            }
        }
    }
}

async fn run_sampler(
    tracker: Arc<StdMutex<AmplitudeTracker>>,
    shared: Arc<Shared>,
    frame_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let frame = lock(&tracker).tick(Instant::now());
                shared.amplitude.send_replace(frame);
            }
        }
    }
}

async fn remove_session_dir(dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove session directory {:?}: {}", dir, e);
        }
    }
}
