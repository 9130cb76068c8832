use anyhow::Result;
use clap::Parser;
use meetrec::cli::{
    handle_devices_command, handle_record_command, handle_recover_command, Cli, CliCommand,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        CliCommand::Version => {
            println!("meetrec {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliCommand::Record(args) => handle_record_command(args).await,
        CliCommand::Recover(args) => handle_recover_command(args).await,
        CliCommand::Devices => handle_devices_command().await,
    }
}
