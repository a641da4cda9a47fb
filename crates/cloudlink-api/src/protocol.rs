//! JSON message model exchanged with the fleet backend.
//!
//! Every frame on either transport is a single JSON text message. Field
//! names follow the backend's wire format: heartbeat traffic is
//! snake_case, log events are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel server id addressing every node on the shared medium.
pub const ALL_SERVERS: &str = "all";

// ── Heartbeat request ───────────────────────────────────────────────

/// Discriminator of an inbound [`HeartbeatRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    #[serde(rename = "heartbeat_request")]
    HeartbeatRequest,
}

/// Liveness check sent by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,

    /// Target node, or [`ALL_SERVERS`].
    #[serde(default)]
    pub server_id: String,

    /// Backend timestamp, echoed verbatim as `request_timestamp`.
    #[serde(default)]
    pub timestamp: String,
}

impl HeartbeatRequest {
    pub fn new(server_id: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::HeartbeatRequest,
            server_id: server_id.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Whether this request is addressed to `server_id`, directly or via `"all"`.
    pub fn targets(&self, server_id: &str) -> bool {
        self.server_id == server_id || self.server_id == ALL_SERVERS
    }
}

// ── Heartbeat response ──────────────────────────────────────────────

/// Discriminator of an outbound [`HeartbeatResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    HeartbeatResponse,
    ShutdownNotification,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatResponse => "heartbeat_response",
            Self::ShutdownNotification => "shutdown_notification",
        }
    }
}

/// Coarse server state reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerState {
    Online,
    #[default]
    Offline,
}

/// Point-in-time vitals snapshot answering a heartbeat request, or the
/// final notice sent on shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub server_id: String,
    pub request_timestamp: String,
    pub response_timestamp: DateTime<Utc>,
    pub server_state: ServerState,
    pub is_running: bool,
    pub tps: f64,
    /// CPU load in percent, `-1.0` when unknown.
    pub cpu_usage: f64,
    pub ram_usage_mb: f64,
    pub players_online: Vec<String>,
    pub max_players: u32,
    pub start_time: Option<DateTime<Utc>>,
}

// ── Log event ───────────────────────────────────────────────────────

/// Discrete player-activity record (join, leave, switch, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub player_name: String,
    pub uuid: String,
    pub action: String,
    pub forced: bool,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    /// A log event stamped with the current time.
    pub fn new(
        player_name: impl Into<String>,
        uuid: impl Into<String>,
        action: impl Into<String>,
        forced: bool,
    ) -> Self {
        Self {
            player_name: player_name.into(),
            uuid: uuid.into(),
            action: action.into(),
            forced,
            timestamp: Utc::now(),
        }
    }
}

// ── Server-to-server message ────────────────────────────────────────

/// Message addressed from one node to another over the pub/sub medium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub sender_id: String,
    pub target_id: String,
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    pub fn new(
        sender_id: impl Into<String>,
        target_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            target_id: target_id.into(),
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

// ── Inbound classification ──────────────────────────────────────────

/// What an inbound text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    HeartbeatRequest(HeartbeatRequest),
    ServerMessage(ServerMessage),
    /// A report some node emits (heartbeat response, shutdown notice, log
    /// event). Seen on shared media, including our own publications.
    PeerReport { kind: String },
    /// Anything else, including non-JSON text.
    Opaque(String),
}

impl Inbound {
    /// Classify a text frame. Never fails: undecodable input is `Opaque`.
    pub fn classify(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Self::Opaque(text.to_owned());
        };
        let Some(object) = value.as_object() else {
            return Self::Opaque(text.to_owned());
        };

        match object.get("type").and_then(Value::as_str) {
            Some("heartbeat_request") => serde_json::from_value(value)
                .map_or_else(|_| Self::Opaque(text.to_owned()), Self::HeartbeatRequest),
            Some(kind @ ("heartbeat_response" | "shutdown_notification")) => Self::PeerReport {
                kind: kind.to_owned(),
            },
            Some(_) => Self::Opaque(text.to_owned()),
            None if object.contains_key("sender_id") && object.contains_key("message_type") => {
                serde_json::from_value(value)
                    .map_or_else(|_| Self::Opaque(text.to_owned()), Self::ServerMessage)
            }
            None if object.contains_key("playerName") && object.contains_key("action") => {
                Self::PeerReport {
                    kind: "log_event".into(),
                }
            }
            None => Self::Opaque(text.to_owned()),
        }
    }
}
