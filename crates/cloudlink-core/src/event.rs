//! Lifecycle events delivered through the [`EventBus`](crate::bus::EventBus).
//!
//! A closed set of variants instead of an event class hierarchy. Each
//! delivered [`Event`] wraps one [`LifecycleEvent`] with the transport,
//! server id and time it was raised.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use strum::{Display, IntoStaticStr};

use cloudlink_api::ResponseKind;

use crate::transport::TransportKind;

// ── Variant payload enums ────────────────────────────────────────────

/// Pub/sub channel operation reported by [`LifecycleEvent::ChannelActivity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChannelOperation {
    Subscribe,
    Unsubscribe,
    Publish,
    MessageReceived,
}

/// Socket status reported by [`LifecycleEvent::StreamStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamStatusKind {
    Open,
    Closed,
    Error,
    MessageSent,
    MessageFailed,
}

// ── LifecycleEvent ───────────────────────────────────────────────────

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleEvent {
    ConnectionEstablished {
        endpoint: String,
        is_reconnect: bool,
    },
    ConnectionLost {
        reason: String,
        /// Reconnect attempts made so far in the current failure streak.
        attempt: u32,
    },
    HeartbeatRequestReceived {
        target_server_id: String,
        raw: String,
    },
    HeartbeatResponseSent {
        kind: ResponseKind,
        success: bool,
        detail: Option<String>,
    },
    LogForwarded {
        player_name: String,
        uuid: String,
        action: String,
        forced: bool,
        success: bool,
    },
    /// Cancellable. Any observer returning [`Verdict::Veto`] stops the retry.
    ReconnectAttempted {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// Terminal: the attempt cap was reached. Only an explicit `connect()` resumes.
    ReconnectExhausted {
        attempts: u32,
        max_attempts: u32,
    },
    ShutdownNotified {
        reason: String,
        graceful: bool,
    },
    MessageReceived {
        content: String,
        message_type: String,
        sender: String,
    },
    AuthenticationFailed {
        status: u16,
        message: String,
    },
    ServerMessageSent {
        target: String,
        message_type: String,
        success: bool,
    },
    /// Pub/sub transport only.
    ChannelActivity {
        channel: String,
        operation: ChannelOperation,
        payload: Option<String>,
    },
    /// Stream transport only.
    StreamStatus {
        status: StreamStatusKind,
        code: u16,
        details: String,
    },
}

impl LifecycleEvent {
    /// Stable snake_case name, for logs.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Whether observers may veto this event.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::ReconnectAttempted { .. })
    }

    /// The only transport allowed to raise this event, if restricted.
    pub fn scope(&self) -> Option<TransportKind> {
        match self {
            Self::ChannelActivity { .. } => Some(TransportKind::PubSub),
            Self::StreamStatus { .. } => Some(TransportKind::Stream),
            _ => None,
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────────

/// A delivered event: payload plus where and when it was raised.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub transport: TransportKind,
    pub server_id: Arc<str>,
    pub timestamp: DateTime<Utc>,
    pub kind: LifecycleEvent,
}

// ── Observers ────────────────────────────────────────────────────────

/// An observer's answer to an event. Only meaningful for cancellable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Allow,
    Veto,
}

/// Receives every event synchronously, on the thread that raised it.
///
/// Implementations must return promptly: the bus has no timeout and a
/// blocked observer stalls the transport that emitted the event.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event) -> Verdict;
}

impl<F> Observer for F
where
    F: Fn(&Event) -> Verdict + Send + Sync,
{
    fn on_event(&self, event: &Event) -> Verdict {
        self(event)
    }
}
