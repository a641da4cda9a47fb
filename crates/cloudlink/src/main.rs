//! `cloudlink`: keeps a game server linked to its fleet backend.

mod cli;
mod commands;
mod error;
mod metrics;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // debug_mode is read before the subscriber exists; a broken file is
    // reported again, properly, by the command itself.
    let debug_mode = cloudlink_config::load_settings(cli.global.config.as_deref())
        .is_ok_and(|s| s.logging.debug_mode);
    init_tracing(cli.global.verbose, debug_mode);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, debug_mode: bool) {
    let filter = match (verbosity, debug_mode) {
        (0, false) => "info",
        (0 | 1, _) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    commands::dispatch(cli).await
}
