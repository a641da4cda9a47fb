//! Command dispatch: bridges CLI args to the link, the settings file and
//! backend storage.

pub mod config_cmd;
pub mod log;
pub mod run;
pub mod storage;

use std::time::Duration;

use cloudlink_config::Settings;
use cloudlink_core::{ConnectionController, ConnectionState};

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// Hand the command to its handler, loading settings on the way.
pub async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let path = cli.global.config.as_deref();
    let load = || cloudlink_config::load_settings(path);

    match cli.command {
        // Works with a missing or invalid file.
        Command::Config(args) => config_cmd::handle(args, path),
        Command::Run(args) => run::handle(&args, &load()?).await,
        Command::Log(args) => log::handle(&args, &load()?).await,
        Command::Storage(args) => storage::handle(args, &load()?).await,
    }
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Validate `settings` and build an idle controller from them.
fn build_controller(settings: &Settings) -> Result<ConnectionController, CliError> {
    let link = settings.link_settings()?;
    Ok(ConnectionController::try_new(link, settings.connection_config())?)
}

/// Wait up to `wait` for the controller's transport to reach `Connected`.
async fn wait_connected(controller: &ConnectionController, wait: Duration) -> Result<(), CliError> {
    let timed_out = || CliError::ConnectTimeout {
        seconds: wait.as_secs(),
    };
    let mut state = controller.subscribe_state().ok_or_else(timed_out)?;

    let reached = matches!(
        tokio::time::timeout(wait, state.wait_for(|s| *s == ConnectionState::Connected)).await,
        Ok(Ok(_))
    );
    if reached { Ok(()) } else { Err(timed_out()) }
}
