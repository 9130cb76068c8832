//! CLI handler for the `record` command.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use super::args::RecordCliArgs;
use crate::audio::{format_elapsed, AmplitudeFrame};
use crate::config::Config;
use crate::global;
use crate::hooks::{DirectoryHistory, HistoryStore, ShellTranscriptionSink, TranscriptionSink};
use crate::recording::{RecordingOrchestrator, RecordingState, StopReport};
use crate::recovery::check_for_recovery;

const METER: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const METER_WIDTH: usize = 16;

pub async fn handle_record_command(args: RecordCliArgs) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(strategy) = args.strategy {
        config.capture.strategy = strategy.into();
    }

    let store = super::checkpoint_store()?;
    if let Some(offer) = check_for_recovery(store.as_ref()).await {
        println!("{}", offer.summary());
        bail!("An unfinished recording is waiting. Run `meetrec recover` before recording again.");
    }

    let orchestrator = Arc::new(RecordingOrchestrator::new(
        super::native_backend(),
        store,
        config.orchestrator_options()?,
    ));
    orchestrator
        .start()
        .await
        .context("Failed to start recording")?;

    let snapshot = orchestrator.get_state();
    if let Some(strategy) = snapshot.strategy {
        println!("Recording ({} capture)", strategy.as_str());
    }
    for degradation in &snapshot.degradations {
        println!("  note: {}", degradation);
    }
    println!("Press Enter to pause/resume, q then Enter to stop, or Ctrl-C.");

    let spinner = create_spinner();
    run_until_stopped(&orchestrator, &spinner, args.duration.map(Duration::from_secs)).await;
    spinner.finish_and_clear();

    let report = orchestrator.stop().await.context("Failed to stop recording")?;
    let Some(report) = report else {
        println!("No audio was captured.");
        return Ok(());
    };

    deliver(&config, &args, report).await
}

async fn run_until_stopped(
    orchestrator: &RecordingOrchestrator,
    spinner: &ProgressBar,
    limit: Option<Duration>,
) {
    let deadline = async move {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut amplitude = orchestrator.subscribe_amplitude();
    let mut refresh = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            line = lines.recv(), if stdin_open => match line {
                Some(line) if line.trim().eq_ignore_ascii_case("q") => break,
                Some(_) => toggle_pause(orchestrator).await,
                None => stdin_open = false,
            },
            _ = refresh.tick() => {
                let frame = amplitude.borrow_and_update().clone();
                let snapshot = orchestrator.get_state();
                spinner.set_message(format!(
                    "{} {} {}",
                    snapshot.state.as_str(),
                    format_elapsed(snapshot.elapsed),
                    meter(&frame)
                ));
            }
        }
    }
}

/// Lines typed on stdin. Read on a plain thread so a pending read never
/// holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn toggle_pause(orchestrator: &RecordingOrchestrator) {
    let result = match orchestrator.get_state().state {
        RecordingState::Recording => orchestrator.pause().await,
        RecordingState::Paused => orchestrator.resume().await,
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!("Could not toggle pause: {}", e);
    }
}

async fn deliver(config: &Config, args: &RecordCliArgs, report: StopReport) -> Result<()> {
    let saved = match &args.output {
        Some(path) => {
            tokio::fs::write(path, report.artifact.bytes())
                .await
                .with_context(|| format!("Failed to write {:?}", path))?;
            path.clone()
        }
        None => {
            DirectoryHistory::new(global::recordings_dir()?)
                .archive(&report.artifact, report.elapsed)
                .await?
        }
    };

    println!(
        "Saved {} of {} audio to {}",
        format_elapsed(report.elapsed),
        report.artifact.media_type(),
        saved.display()
    );
    for degradation in &report.degradations {
        println!("  note: {}", degradation);
    }

    let sink = ShellTranscriptionSink::new(
        config.hooks.transcribe_command.clone(),
        config.hooks.transcribe_timeout_seconds,
        global::recordings_dir()?.join("spool"),
    );
    if args.no_transcribe || !sink.is_configured() {
        return Ok(());
    }
    if let Err(e) = sink.submit(&report.artifact, report.elapsed).await {
        // The recording is already on disk
        eprintln!("Transcription failed: {:#}", e);
    }
    Ok(())
}

fn meter(frame: &AmplitudeFrame) -> String {
    if frame.bars.is_empty() {
        return String::new();
    }
    (0..METER_WIDTH)
        .map(|i| {
            let bar = frame.bars[i * frame.bars.len() / METER_WIDTH];
            let index = (bar.clamp(0.0, 1.0) * (METER.len() - 1) as f32).round() as usize;
            METER[index]
        })
        .collect()
}

fn create_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.red} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
