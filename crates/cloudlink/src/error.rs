//! CLI error types with miette diagnostics.
//!
//! Maps `ConfigError` and `LinkError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use cloudlink_config::ConfigError;
use cloudlink_core::LinkError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("No link to the backend within {seconds}s")]
    #[diagnostic(
        code(cloudlink::connect_timeout),
        help(
            "Check websocket.host / websocket.port (or the redis / mqtt section) and that\n\
             the backend is reachable. Run with -v to see each attempt."
        )
    )]
    ConnectTimeout { seconds: u64 },

    #[error("Backend did not confirm the log event for '{player}'")]
    #[diagnostic(
        code(cloudlink::log_not_forwarded),
        help("The link was up but delivery failed or timed out. Retry with a larger --wait.")
    )]
    LogNotForwarded { player: String },

    #[error(transparent)]
    #[diagnostic(code(cloudlink::link))]
    Link(#[from] LinkError),

    // ── Storage ──────────────────────────────────────────────────────

    #[error("No value stored under '{key}'")]
    #[diagnostic(code(cloudlink::not_found))]
    KeyNotFound { key: String },

    #[error("Storage {action} for '{key}' failed")]
    #[diagnostic(
        code(cloudlink::storage_failed),
        help("Run with -v for the backend's response.")
    )]
    StorageFailed { action: &'static str, key: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(
        code(cloudlink::validation),
        help(
            "Edit the settings file (see: cloudlink config path) or override it with\n\
             CLOUDLINK_<SECTION>__<KEY> environment variables."
        )
    )]
    Validation { field: String, reason: String },

    #[error("Settings file already exists at {path}")]
    #[diagnostic(
        code(cloudlink::config_exists),
        help("Use --force to overwrite it.")
    )]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(cloudlink::config))]
    Config(ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON value: {0}")]
    #[diagnostic(code(cloudlink::json), help("Quote JSON strings, e.g. '\"text\"'."))]
    Json(#[from] serde_json::Error),

    #[error("Could not render settings: {0}")]
    Render(#[from] toml::ser::Error),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectTimeout { .. } | Self::Link(_) => exit_code::CONNECTION,
            Self::LogNotForwarded { .. } => exit_code::TIMEOUT,
            Self::KeyNotFound { .. } => exit_code::NOT_FOUND,
            Self::ConfigExists { .. } => exit_code::CONFLICT,
            Self::Validation { .. } | Self::Json(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}
