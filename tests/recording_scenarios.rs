//! End-to-end recording sessions against a scripted backend.
//!
//! Time-based scenarios run on tokio's paused clock.

mod common;

use common::{entries, test_options, FakeBackend};
use meetrec::audio::{MediaType, SourceTag, StrategyKind};
use meetrec::backend::{AudioBackend, AudioDevice};
use meetrec::recording::{OrchestratorOptions, RecordingOrchestrator, RecordingState};
use meetrec::recovery::{CheckpointStore, MemoryCheckpointStore};
use meetrec::{CaptureError, Degradation};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn assert_close(actual: Duration, expected: Duration) {
    let delta = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        delta <= ms(50),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

struct Harness {
    backend: Arc<FakeBackend>,
    store: Arc<MemoryCheckpointStore>,
    orchestrator: RecordingOrchestrator,
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
}

fn harness(backend: FakeBackend) -> Harness {
    harness_with(backend, |_| {})
}

fn harness_with(backend: FakeBackend, configure: impl FnOnce(&mut OrchestratorOptions)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let backend = Arc::new(backend);
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut options = test_options(&root);
    configure(&mut options);
    let orchestrator = RecordingOrchestrator::new(
        backend.clone() as Arc<dyn AudioBackend>,
        store.clone() as Arc<dyn CheckpointStore>,
        options,
    );
    Harness {
        backend,
        store,
        orchestrator,
        _dir: dir,
        root,
    }
}

#[tokio::test(start_paused = true)]
async fn combined_pause_resume_reports_active_time_only() {
    let h = harness(FakeBackend::combined());

    h.orchestrator.start().await.unwrap();
    assert_eq!(h.orchestrator.get_state().strategy, Some(StrategyKind::Combined));

    tokio::time::sleep(ms(2000)).await;
    h.orchestrator.pause().await.unwrap();
    assert_eq!(h.orchestrator.get_state().state, RecordingState::Paused);

    tokio::time::sleep(ms(1000)).await;
    // Frozen while paused
    assert_close(h.orchestrator.get_state().elapsed, ms(2000));

    h.orchestrator.resume().await.unwrap();
    tokio::time::sleep(ms(2000)).await;

    let report = h.orchestrator.stop().await.unwrap().expect("artifact");
    assert_close(report.elapsed, ms(4000));
    assert_eq!(report.strategy, StrategyKind::Combined);
    assert_eq!(report.artifact.media_type(), MediaType::Wav);
    assert!(report.degradations.is_empty());

    let reader = hound::WavReader::new(std::io::Cursor::new(report.artifact.bytes())).unwrap();
    assert_eq!(reader.spec().sample_rate, common::SAMPLE_RATE);
    assert!(reader.len() > 0);

    let state = h.orchestrator.get_state();
    assert_eq!(state.state, RecordingState::Stopped);
    // Frozen after stop
    tokio::time::sleep(ms(500)).await;
    assert_close(h.orchestrator.get_state().elapsed, ms(4000));

    assert!(h.store.is_empty(), "checkpoint cleared after clean stop");
    assert_eq!(entries(&h.root.join("sessions")), 0, "temp files removed");
}

#[tokio::test(start_paused = true)]
async fn dual_track_pause_is_a_no_op() {
    let h = harness(FakeBackend::dual_track());

    h.orchestrator.start().await.unwrap();
    assert_eq!(
        h.orchestrator.get_state().strategy,
        Some(StrategyKind::DualTrack)
    );

    tokio::time::sleep(ms(1000)).await;
    h.orchestrator.pause().await.unwrap();
    assert_eq!(h.orchestrator.get_state().state, RecordingState::Recording);
    h.orchestrator.resume().await.unwrap();
    assert_eq!(h.orchestrator.get_state().state, RecordingState::Recording);

    tokio::time::sleep(ms(1000)).await;
    // Pause was refused, so the clock kept running
    assert_close(h.orchestrator.get_state().elapsed, ms(2000));

    let report = h.orchestrator.stop().await.unwrap().expect("artifact");
    assert_eq!(h.backend.merges.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.captures.load(Ordering::SeqCst), 1);
    assert!(!report.artifact.is_empty());
    assert!(report.degradations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dual_track_without_monitor_records_mic_only() {
    let backend = FakeBackend::dual_track().with_devices(vec![AudioDevice::new(
        "alsa_input.usb-headset",
        "USB Headset Microphone",
    )]);
    let h = harness_with(backend, |options| options.keep_temp_files = true);

    h.orchestrator.start().await.unwrap();
    let mic_path = h.store.load().await.unwrap().unwrap().temp_file_refs[0].clone();
    let state = h.orchestrator.get_state();
    assert!(state.degraded);
    assert!(state.degradations.contains(&Degradation::CaptureUnavailable));
    // Retried once before giving up on a monitor
    assert_eq!(h.backend.list_calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(ms(1500)).await;
    let report = h.orchestrator.stop().await.unwrap().expect("artifact");

    assert_eq!(report.artifact.media_type(), MediaType::Wav);
    assert!(mic_path.ends_with("mic.wav"));
    assert_eq!(report.artifact.bytes(), std::fs::read(&mic_path).unwrap().as_slice());
    assert_eq!(h.backend.captures.load(Ordering::SeqCst), 0);
    assert_eq!(h.backend.merges.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn merge_failure_falls_back_to_microphone() {
    let h = harness(FakeBackend::dual_track().with_merge_failure());

    h.orchestrator.start().await.unwrap();
    tokio::time::sleep(ms(1500)).await;
    let report = h.orchestrator.stop().await.unwrap().expect("artifact");

    assert_eq!(report.artifact.media_type(), MediaType::Wav);
    let reader = hound::WavReader::new(std::io::Cursor::new(report.artifact.bytes())).unwrap();
    assert!(reader.len() > 0);
    assert!(report
        .degradations
        .iter()
        .any(|d| matches!(d, Degradation::MergeFailed { .. })));
    assert!(h.orchestrator.get_state().degraded);
}

#[tokio::test(start_paused = true)]
async fn external_capture_exit_degrades_but_keeps_recording() {
    let h = harness(FakeBackend::dual_track().with_capture_exit_after(ms(500)));

    h.orchestrator.start().await.unwrap();
    tokio::time::sleep(ms(1500)).await;

    let state = h.orchestrator.get_state();
    assert_eq!(state.state, RecordingState::Recording);
    assert!(state
        .degradations
        .iter()
        .any(|d| matches!(d, Degradation::ProcessExitedEarly { .. })));

    let report = h.orchestrator.stop().await.unwrap().expect("artifact");
    assert!(!report.artifact.is_empty());
}

#[tokio::test(start_paused = true)]
async fn forced_dual_track_without_tool_is_backend_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options(dir.path());
    options.preference = meetrec::audio::StrategyPreference::DualTrack;
    let orchestrator = RecordingOrchestrator::new(
        Arc::new(FakeBackend::combined().without_capture_tool()),
        Arc::new(MemoryCheckpointStore::new()),
        options,
    );

    let err = orchestrator.start().await.unwrap_err();
    assert!(matches!(err, CaptureError::BackendUnavailable(_)));
    assert_eq!(orchestrator.get_state().state, RecordingState::Idle);
}

#[tokio::test(start_paused = true)]
async fn forced_combined_without_loopback_runs_mic_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options(dir.path());
    options.preference = meetrec::audio::StrategyPreference::Combined;
    let orchestrator = RecordingOrchestrator::new(
        Arc::new(FakeBackend::dual_track()),
        Arc::new(MemoryCheckpointStore::new()),
        options,
    );

    orchestrator.start().await.unwrap();
    let state = orchestrator.get_state();
    assert_eq!(state.strategy, Some(StrategyKind::Combined));
    assert!(state.degradations.contains(&Degradation::CaptureUnavailable));

    tokio::time::sleep(ms(500)).await;
    assert!(orchestrator.stop().await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn permission_denied_leaves_idle() {
    let h = harness(FakeBackend::combined().with_mic_denied());

    let err = h.orchestrator.start().await.unwrap_err();
    assert!(matches!(err, CaptureError::PermissionDenied(_)));
    assert_eq!(h.orchestrator.get_state().state, RecordingState::Idle);
    assert!(h.store.is_empty());
    assert_eq!(entries(&h.root.join("sessions")), 0);
}

#[tokio::test(start_paused = true)]
async fn illegal_transitions_are_rejected() {
    let h = harness(FakeBackend::combined());

    assert!(matches!(
        h.orchestrator.pause().await,
        Err(CaptureError::InvalidTransition { action: "pause", state: "idle" })
    ));
    assert!(matches!(
        h.orchestrator.stop().await,
        Err(CaptureError::InvalidTransition { action: "stop", .. })
    ));

    h.orchestrator.start().await.unwrap();
    assert!(matches!(
        h.orchestrator.start().await,
        Err(CaptureError::InvalidTransition { action: "start", state: "recording" })
    ));
    assert!(matches!(
        h.orchestrator.resume().await,
        Err(CaptureError::InvalidTransition { action: "resume", .. })
    ));

    h.orchestrator.pause().await.unwrap();
    assert!(matches!(
        h.orchestrator.pause().await,
        Err(CaptureError::InvalidTransition { action: "pause", state: "paused" })
    ));

    // Stopping straight from paused is allowed
    assert!(h.orchestrator.stop().await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn checkpoint_tracks_session_until_stop() {
    let h = harness(FakeBackend::dual_track());

    h.orchestrator.start().await.unwrap();
    let checkpoint = h.store.load().await.unwrap().expect("checkpoint at start");
    assert_eq!(checkpoint.strategy, StrategyKind::DualTrack);
    assert_eq!(checkpoint.platform, "test");
    assert_eq!(checkpoint.temp_file_refs.len(), 2);
    assert!(checkpoint.temp_file_refs[0].ends_with("mic.wav"));
    assert!(checkpoint.temp_file_refs[1].ends_with("system.ogg"));
    for path in &checkpoint.temp_file_refs {
        assert!(path.exists(), "{:?} written incrementally", path);
    }

    // Periodic tick picks up progress
    tokio::time::sleep(Duration::from_secs(61)).await;
    let ticked = h.store.load().await.unwrap().unwrap();
    assert!(ticked.duration_ms >= 60_000);
    assert!(ticked.chunk_count > 0);
    assert!(ticked.last_save_time >= checkpoint.last_save_time);

    h.orchestrator.stop().await.unwrap();
    assert!(h.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn pause_is_persisted_in_checkpoint() {
    let h = harness(FakeBackend::combined());

    h.orchestrator.start().await.unwrap();
    tokio::time::sleep(ms(300)).await;
    h.orchestrator.pause().await.unwrap();
    assert!(h.store.load().await.unwrap().unwrap().paused);

    h.orchestrator.resume().await.unwrap();
    assert!(!h.store.load().await.unwrap().unwrap().paused);
    h.orchestrator.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn amplitude_frames_follow_state() {
    let h = harness(FakeBackend::combined());
    let mut frames = h.orchestrator.subscribe_amplitude();
    let mut states = h.orchestrator.subscribe_state();

    h.orchestrator.start().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), RecordingState::Recording);

    tokio::time::sleep(ms(1000)).await;
    let frame = frames.borrow_and_update().clone();
    assert!(frame.mic > 0.5, "mic level {}", frame.mic);
    assert!(frame.peak() > 0.5);

    h.orchestrator.pause().await.unwrap();
    let paused = frames.borrow_and_update().clone();
    assert!(paused.bars.iter().all(|b| *b == 0.0));

    h.orchestrator.stop().await.unwrap();
    assert_eq!(*states.borrow(), RecordingState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn silent_session_still_yields_artifact() {
    let h = harness(FakeBackend::combined().with_silence());

    h.orchestrator.start().await.unwrap();
    tokio::time::sleep(ms(500)).await;
    let report = h.orchestrator.stop().await.unwrap().expect("artifact");
    assert!(!report.artifact.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stopped_is_terminal() {
    let h = harness(FakeBackend::combined());

    h.orchestrator.start().await.unwrap();
    tokio::time::sleep(ms(500)).await;
    h.orchestrator.stop().await.unwrap();

    assert!(matches!(
        h.orchestrator.start().await,
        Err(CaptureError::InvalidTransition { action: "start", state: "stopped" })
    ));
    assert!(matches!(
        h.orchestrator.resume().await,
        Err(CaptureError::InvalidTransition { action: "resume", state: "stopped" })
    ));
    assert!(matches!(
        h.orchestrator.stop().await,
        Err(CaptureError::InvalidTransition { action: "stop", state: "stopped" })
    ));
    assert_eq!(h.orchestrator.get_state().state, RecordingState::Stopped);
    assert_close(h.orchestrator.get_state().elapsed, ms(500));
}

#[tokio::test(start_paused = true)]
async fn stop_right_after_start_yields_artifact() {
    let h = harness(FakeBackend::combined());

    h.orchestrator.start().await.unwrap();
    h.orchestrator.pause().await.unwrap();
    let report = h.orchestrator.stop().await.unwrap().expect("artifact");

    // No samples made it to disk, the finalized WAV is still the take
    let reader = hound::WavReader::new(std::io::Cursor::new(report.artifact.bytes())).unwrap();
    assert_eq!(reader.spec().sample_rate, common::SAMPLE_RATE);
    assert!(h.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn source_failing_to_stop_keeps_files_for_recovery() {
    let h = harness(FakeBackend::combined());

    h.orchestrator.start().await.unwrap();
    tokio::time::sleep(ms(500)).await;
    let session_dir = h.store.load().await.unwrap().unwrap().temp_file_refs[0]
        .parent()
        .unwrap()
        .to_path_buf();
    // The graph can no longer report on its file once stopped
    std::fs::remove_dir_all(&session_dir).unwrap();

    assert!(h.orchestrator.stop().await.unwrap().is_none());

    let state = h.orchestrator.get_state();
    assert_eq!(state.state, RecordingState::Stopped);
    assert!(state.degradations.iter().any(|d| matches!(
        d,
        Degradation::SourceFailed { source: SourceTag::Mic, .. }
    )));
    assert!(!h.store.is_empty(), "checkpoint kept for startup recovery");
}

#[tokio::test(start_paused = true)]
async fn transitions_queue_behind_a_stop_in_flight() {
    let h = harness(FakeBackend::dual_track().with_slow_terminate(ms(2000)));
    let orchestrator = Arc::new(h.orchestrator);

    orchestrator.start().await.unwrap();
    tokio::time::sleep(ms(500)).await;

    let stopping = Arc::clone(&orchestrator);
    let stop = tokio::spawn(async move { stopping.stop().await });
    tokio::time::sleep(ms(100)).await;
    assert_eq!(orchestrator.get_state().state, RecordingState::Stopping);

    let asked = tokio::time::Instant::now();
    let paused = orchestrator.pause().await;

    // Waited out the whole stop, then saw its end state
    assert!(asked.elapsed() >= ms(1800), "waited {:?}", asked.elapsed());
    assert!(matches!(
        paused,
        Err(CaptureError::InvalidTransition { action: "pause", state: "stopped" })
    ));
    assert!(stop.await.unwrap().unwrap().is_some());
    assert!(h.store.is_empty());
}
