//! Publish/subscribe broker abstraction.
//!
//! A [`Broker`] opens a [`PubSubSession`]: a publish handle plus a stream
//! of [`SessionEvent`]s from the subscription side. The pub/sub transport
//! in `cloudlink-core` is written against this trait only: the Redis
//! implementation in [`redis`] and the MQTT one in [`mqtt`] are
//! interchangeable, and tests swap in an in-process broker.

pub mod mqtt;
pub mod redis;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Error;

pub use self::mqtt::{MqttBroker, MqttSettings};
pub use self::redis::{RedisBroker, RedisSettings};

// ── Channel capacity ─────────────────────────────────────────────────

/// Buffered session events per open session.
pub const SESSION_EVENT_CAPACITY: usize = 256;

// ── Session events ───────────────────────────────────────────────────

/// Which half of a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPath {
    Publish,
    Subscribe,
}

impl std::fmt::Display for SessionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
        })
    }
}

/// Something that happened on an open session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The broker confirmed a subscription.
    Subscribed { channel: String },
    /// A message arrived on a subscribed channel.
    Delivery { channel: String, payload: String },
    /// One half of the session died. No further events follow.
    Lost { path: SessionPath, error: Error },
}

// ── Traits ───────────────────────────────────────────────────────────

/// Outbound half of a session.
///
/// `publish` only enqueues; delivery happens on the session's own task.
/// Messages published through one handle keep their relative order.
pub trait Publisher: Send + Sync {
    fn publish(&self, channel: &str, payload: &str) -> Result<(), Error>;

    /// Hang up both halves of the session. Idempotent.
    fn close(&self);
}

/// A connected session: publish handle plus inbound event stream.
pub struct PubSubSession {
    pub publisher: Arc<dyn Publisher>,
    pub events: mpsc::Receiver<SessionEvent>,
}

impl std::fmt::Debug for PubSubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSession").finish_non_exhaustive()
    }
}

/// Factory for pub/sub sessions.
pub trait Broker: Send + Sync {
    /// Human-readable endpoint, used in logs and lifecycle events.
    fn endpoint(&self) -> String;

    /// Connect both halves and subscribe to `channels`.
    ///
    /// Resolves once the broker has accepted the connection; subscription
    /// confirmations arrive later as [`SessionEvent::Subscribed`].
    fn open<'a>(&'a self, channels: &'a [String]) -> BoxFuture<'a, Result<PubSubSession, Error>>;
}
