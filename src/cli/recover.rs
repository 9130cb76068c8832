//! CLI handler for the `recover` command.

use anyhow::{bail, Result};
use dialoguer::{theme::ColorfulTheme, Select};

use super::args::RecoverCliArgs;
use crate::config::Config;
use crate::global;
use crate::hooks::{DirectoryHistory, ShellTranscriptionSink};
use crate::recovery::{check_for_recovery, resolve, RecoveryOutcome, Resolution};

pub async fn handle_recover_command(args: RecoverCliArgs) -> Result<()> {
    let config = Config::load()?;
    let store = super::checkpoint_store()?;

    let Some(offer) = check_for_recovery(store.as_ref()).await else {
        println!("Nothing to recover.");
        return Ok(());
    };

    println!("{}", offer.summary());
    println!("Continuing the interrupted take is not supported; it can be transcribed, saved or discarded.");
    println!();

    let resolution = match args.action {
        Some(action) => action.into(),
        None => prompt_resolution()?,
    };

    let sink = ShellTranscriptionSink::new(
        config.hooks.transcribe_command.clone(),
        config.hooks.transcribe_timeout_seconds,
        global::recordings_dir()?.join("spool"),
    );
    if resolution == Resolution::TranscribeNow && !sink.is_configured() {
        bail!("No transcription command configured; set hooks.transcribe_command or choose archive");
    }
    let history = DirectoryHistory::new(global::recordings_dir()?);
    let backend = super::native_backend();

    match resolve(
        offer,
        resolution,
        backend.as_ref(),
        store.as_ref(),
        &sink,
        &history,
    )
    .await?
    {
        RecoveryOutcome::Transcribed => println!("Recovered recording sent to transcription."),
        RecoveryOutcome::Archived(path) => println!("Recovered recording saved to {}", path.display()),
        RecoveryOutcome::Discarded => println!("Unfinished recording discarded."),
        RecoveryOutcome::NothingRecoverable => {
            println!("The unfinished recording held no usable audio; it was removed.")
        }
    }

    Ok(())
}

fn prompt_resolution() -> Result<Resolution> {
    let theme = ColorfulTheme::default();
    let labels: Vec<&str> = Resolution::ALL.iter().map(|r| r.label()).collect();

    let selection = Select::with_theme(&theme)
        .with_prompt("What should happen to it?")
        .items(&labels)
        .default(0)
        .interact()?;

    Ok(Resolution::ALL[selection])
}
