//! The transport contract and its two implementations.
//!
//! [`StreamTransport`] keeps one websocket to the backend;
//! [`PubSubTransport`] shares a broker with every other node. Both run
//! the same reconnect state machine (see `link`) and differ only in wire
//! mechanics and addressing.

mod link;
pub mod pubsub;
pub mod stream;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::watch;

use cloudlink_api::{HeartbeatResponse, LogEvent, ServerMessage};

use crate::bus::EventBus;
use crate::config::{Endpoint, LinkSettings, SharedConfig};
use crate::error::LinkError;
use crate::metrics::ResponseBuilder;
use crate::scheduler::Scheduler;
use crate::state::ConnectionState;

pub use pubsub::PubSubTransport;
pub use stream::StreamTransport;

// ── TransportKind ────────────────────────────────────────────────────

/// Transport variant, as named in settings files and event envelopes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
pub enum TransportKind {
    #[strum(to_string = "websocket", serialize = "stream")]
    #[serde(rename = "websocket", alias = "stream")]
    Stream,
    #[strum(to_string = "pubsub", serialize = "mqtt")]
    #[serde(rename = "pubsub", alias = "mqtt")]
    PubSub,
}

// ── Contract ─────────────────────────────────────────────────────────

/// One link to the backend, owning its own connection state.
///
/// `connect` and `disconnect` return immediately; connection work runs
/// on the scheduler. Sends are best-effort: `Ok` means the message was
/// handed to the wire layer, not that the backend received it.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> ConnectionState;

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    /// Start connecting. No-op unless `Disconnected`.
    fn connect(&self);

    /// Tear down for good and announce it with `ShutdownNotified`. The
    /// instance is `ShuttingDown` afterwards.
    fn disconnect(&self);

    /// Tear down like `disconnect` without announcing it. Used when the
    /// owner has already reported the shutdown.
    fn release(&self);

    fn send_heartbeat_response(&self, response: &HeartbeatResponse) -> Result<(), LinkError>;

    fn send_log_event(&self, event: &LogEvent) -> Result<(), LinkError>;

    fn send_shutdown_notification(&self, response: &HeartbeatResponse) -> Result<(), LinkError>;

    fn send_server_message(&self, message: &ServerMessage) -> Result<(), LinkError> {
        let _ = message;
        Err(LinkError::Unsupported {
            operation: "server messaging",
            transport: self.kind(),
        })
    }
}

/// Shared services a transport is built with.
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub bus: EventBus,
    pub scheduler: Scheduler,
    pub responder: Arc<ResponseBuilder>,
    /// Live tuning, re-read on every attempt.
    pub config: SharedConfig,
}

/// Build the transport selected by `settings`.
pub fn build(settings: &LinkSettings, ctx: TransportContext) -> Result<Arc<dyn Transport>, LinkError> {
    let transport: Arc<dyn Transport> = match &settings.endpoint {
        Endpoint::Stream(endpoint) => {
            Arc::new(StreamTransport::new(&settings.server_id, endpoint, ctx)?)
        }
        Endpoint::PubSub(endpoint) => {
            Arc::new(PubSubTransport::new(&settings.server_id, endpoint, ctx))
        }
    };
    Ok(transport)
}
