// ── Core error types ──
//
// Errors raised at the Transport seam. The ConnectionController never
// hands these to the host for connectivity problems; they are logged and
// mirrored onto the EventBus instead.

use thiserror::Error;

use crate::transport::TransportKind;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Link state ───────────────────────────────────────────────────
    #[error("Not connected")]
    NotConnected,

    #[error("Link is shutting down")]
    ShutDown,

    #[error("No Tokio runtime is running on this thread")]
    NoRuntime,

    // ── Capability ───────────────────────────────────────────────────
    #[error("{operation} is not supported by the {transport} transport")]
    Unsupported {
        operation: &'static str,
        transport: TransportKind,
    },

    // ── Wire errors (wrapped) ────────────────────────────────────────
    #[error(transparent)]
    Api(#[from] cloudlink_api::Error),
}

impl LinkError {
    /// Whether this failure should be retried by the reconnect path.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Api(_))
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Api(cloudlink_api::Error::Serialization(err))
    }
}
