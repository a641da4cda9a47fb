// ── Runtime link configuration ──
//
// These types describe *where* and *how* to link to the backend. They
// carry endpoint and credential data plus reconnect tuning, but never
// touch disk. `cloudlink-config` (or any host) builds them and hands them in.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use secrecy::SecretString;
use url::Url;

use cloudlink_api::pubsub::Broker;
use cloudlink_api::{TlsMode, TransportConfig};

use crate::metrics::ResponseOptions;
use crate::transport::TransportKind;

/// Reconnect and liveness tuning.
///
/// Immutable once built; the controller swaps in a fresh value when a
/// setter is called. Transports read the current value for every dial and
/// every reconnect decision; a retry already on its timer keeps its delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Fixed delay before every reconnect attempt.
    pub reconnect_interval: Duration,
    /// Consecutive automatic reconnects before giving up.
    pub max_reconnect_attempts: u32,
    /// Upper bound on connection establishment.
    pub heartbeat_timeout: Duration,
}

/// Tuning shared between the controller and its transports.
pub type SharedConfig = Arc<ArcSwap<ConnectionConfig>>;

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            heartbeat_timeout: Duration::from_secs(20),
        }
    }
}

/// TLS verification strategy for the HTTP paths.
#[derive(Debug, Clone, Default)]
pub enum TlsVerification {
    /// Bundled webpki roots (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification (self-signed backends).
    DangerAcceptInvalid,
}

impl TlsVerification {
    pub(crate) fn to_transport(&self, timeout: Duration) -> TransportConfig {
        let tls = match self {
            Self::SystemDefaults => TlsMode::System,
            Self::CustomCa(path) => TlsMode::CustomCa(path.clone()),
            Self::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
        };
        TransportConfig { tls, timeout }
    }
}

/// Point-to-point websocket endpoint.
#[derive(Debug, Clone)]
pub struct StreamEndpoint {
    /// Backend HTTP(S) root, e.g. `https://cloud.example.net:8080`.
    pub base_url: Url,
    pub auth_token: SecretString,
    pub tls: TlsVerification,
    /// Timeout for each log POST.
    pub request_timeout: Duration,
}

impl StreamEndpoint {
    pub fn new(base_url: Url, auth_token: SecretString) -> Self {
        Self {
            base_url,
            auth_token,
            tls: TlsVerification::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Broadcast-medium endpoint.
#[derive(Clone)]
pub struct PubSubEndpoint {
    pub broker: Arc<dyn Broker>,
    /// Channel every node listens on.
    pub shared_channel: String,
    /// Prefix of the per-node channel `{prefix}:{server_id}`.
    pub channel_prefix: String,
}

impl fmt::Debug for PubSubEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubEndpoint")
            .field("broker", &self.broker.endpoint())
            .field("shared_channel", &self.shared_channel)
            .field("channel_prefix", &self.channel_prefix)
            .finish()
    }
}

impl PubSubEndpoint {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            shared_channel: "echocloud:all".into(),
            channel_prefix: "echocloud".into(),
        }
    }

    /// `{prefix}:{id}`
    pub fn channel_for(&self, id: &str) -> String {
        format!("{}:{id}", self.channel_prefix)
    }
}

/// Which transport to run, and where it points.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Stream(StreamEndpoint),
    PubSub(PubSubEndpoint),
}

impl Endpoint {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stream(_) => TransportKind::Stream,
            Self::PubSub(_) => TransportKind::PubSub,
        }
    }
}

/// Everything the controller needs besides tuning.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub server_id: String,
    pub endpoint: Endpoint,
    pub response: ResponseOptions,
}

impl LinkSettings {
    pub fn new(server_id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            server_id: server_id.into(),
            endpoint,
            response: ResponseOptions::default(),
        }
    }
}
