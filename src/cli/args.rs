use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::audio::StrategyPreference;
use crate::recovery::Resolution;

#[derive(Parser, Debug)]
#[command(name = "meetrec")]
#[command(about = "Crash-safe meeting recorder", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Record a meeting (Enter pauses/resumes, q or Ctrl-C stops)
    Record(RecordCliArgs),
    /// Transcribe, archive or discard a recording interrupted by a crash
    Recover(RecoverCliArgs),
    /// Show capture capabilities and system audio devices
    Devices,
    /// Print version information
    Version,
}

#[derive(ClapArgs, Debug)]
pub struct RecordCliArgs {
    /// Stop automatically after this many seconds
    #[arg(short, long)]
    pub duration: Option<u64>,
    /// Override the configured capture strategy
    #[arg(short, long, value_enum)]
    pub strategy: Option<StrategyArg>,
    /// Write the recording here instead of the recordings directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Skip the configured transcription command
    #[arg(long)]
    pub no_transcribe: bool,
}

#[derive(ClapArgs, Debug)]
pub struct RecoverCliArgs {
    /// What to do with the unfinished recording (prompts when omitted)
    #[arg(value_enum)]
    pub action: Option<RecoverAction>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyArg {
    Auto,
    Combined,
    DualTrack,
}

impl From<StrategyArg> for StrategyPreference {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Auto => StrategyPreference::Auto,
            StrategyArg::Combined => StrategyPreference::Combined,
            StrategyArg::DualTrack => StrategyPreference::DualTrack,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoverAction {
    Transcribe,
    Archive,
    Discard,
}

impl From<RecoverAction> for Resolution {
    fn from(action: RecoverAction) -> Self {
        match action {
            RecoverAction::Transcribe => Resolution::TranscribeNow,
            RecoverAction::Archive => Resolution::ArchiveAndStartFresh,
            RecoverAction::Discard => Resolution::Discard,
        }
    }
}
