//! Settings for the cloud link.
//!
//! One TOML file (`settings.toml`), overlaid by `CLOUDLINK_`-prefixed
//! environment variables, validated and translated into
//! `cloudlink_core::{LinkSettings, ConnectionConfig}`. Nothing here opens
//! a connection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use cloudlink_api::pubsub::{self, MqttBroker, RedisBroker};
use cloudlink_core::{
    ConnectionConfig, Endpoint, LinkSettings, PubSubEndpoint, ResponseOptions, StreamEndpoint,
    TlsVerification, TransportKind,
};

/// Placeholder written into fresh settings files.
pub const PLACEHOLDER_TOKEN: &str = "CHANGE_ME_TO_YOUR_AUTH_TOKEN";
/// Server id used until one is configured.
pub const UNKNOWN_SERVER_ID: &str = "UNKNOWN";

const SETTINGS_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "CLOUDLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize settings: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("settings loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML settings structs ───────────────────────────────────────────

/// The whole settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub communication: CommunicationSettings,
    pub websocket: WebSocketSettings,
    pub redis: RedisSettings,
    pub mqtt: MqttSettings,
    pub heartbeat: HeartbeatSettings,
    pub logging: LoggingSettings,
}

/// Medium carrying the link, as written in `communication.type`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    /// Websocket to the backend, logs over HTTP.
    #[default]
    #[serde(alias = "stream")]
    Websocket,
    /// Redis pub/sub.
    #[serde(alias = "pubsub")]
    Redis,
    /// MQTT broker.
    Mqtt,
}

impl Medium {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Websocket => "websocket",
            Self::Redis => "redis",
            Self::Mqtt => "mqtt",
        }
    }

    pub fn transport_kind(self) -> TransportKind {
        match self {
            Self::Websocket => TransportKind::Stream,
            Self::Redis | Self::Mqtt => TransportKind::PubSub,
        }
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommunicationSettings {
    #[serde(rename = "type")]
    pub kind: Medium,
    /// Seconds between reconnect attempts.
    pub reconnect_interval: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for CommunicationSettings {
    fn default() -> Self {
        Self {
            kind: Medium::Websocket,
            reconnect_interval: 30,
            max_reconnect_attempts: 5,
        }
    }
}

/// Backend address and node credentials. Also used by the pub/sub
/// transport for the server id, and by the storage and log paths.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketSettings {
    pub host: String,
    pub port: u16,
    pub use_https: bool,
    pub server_id: String,
    pub auth_token: String,
    /// Accept invalid certificates on the HTTP paths.
    pub insecure: bool,
    /// Custom CA certificate for the HTTP paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8080,
            use_https: true,
            server_id: UNKNOWN_SERVER_ID.into(),
            auth_token: PLACEHOLDER_TOKEN.into(),
            insecure: false,
            ca_cert: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Logical database index.
    pub database: i64,
    /// Shared channel every node subscribes to.
    pub channel: String,
    /// Prefix of the per-node channel `{prefix}:{server_id}`.
    pub prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: pubsub::redis::DEFAULT_PORT,
            password: None,
            database: 0,
            channel: "echocloud:all".into(),
            prefix: "echocloud".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Shared channel every node subscribes to.
    pub channel: String,
    /// Prefix of the per-node channel `{prefix}:{server_id}`.
    pub prefix: String,
    /// Broker keep-alive, in seconds.
    pub keep_alive: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            channel: "echocloud:all".into(),
            prefix: "echocloud".into(),
            keep_alive: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Expected seconds between backend heartbeat requests.
    pub interval: u64,
    /// Seconds allowed for connection establishment.
    pub timeout: u64,
    pub send_player_count: bool,
    pub send_performance_data: bool,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: 10,
            timeout: 20,
            send_player_count: true,
            send_performance_data: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_player_joins: bool,
    pub log_player_leaves: bool,
    pub log_server_switches: bool,
    pub debug_mode: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_player_joins: true,
            log_player_leaves: true,
            log_server_switches: true,
            debug_mode: false,
        }
    }
}

impl LoggingSettings {
    /// Whether player activity `action` should be forwarded. Unknown
    /// actions always are.
    pub fn should_log(&self, action: &str) -> bool {
        match action.to_ascii_lowercase().as_str() {
            "join" => self.log_player_joins,
            "leave" | "quit" => self.log_player_leaves,
            "switch" => self.log_server_switches,
            _ => true,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

/// Resolve the settings file path via platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("net", "echocloud", "cloudlink").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("cloudlink");
            p.push(SETTINGS_FILE);
            p
        },
        |dirs| dirs.config_dir().join(SETTINGS_FILE),
    )
}

// ── Loading & saving ────────────────────────────────────────────────

/// Load settings from `path` (or the default location) plus environment.
///
/// A missing file is not an error: defaults and environment still apply.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let figment = Figment::new()
        .merge(Serialized::defaults(Settings::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let settings: Settings = figment.extract()?;
    tracing::debug!(path = %path.display(), "settings loaded");
    Ok(settings)
}

/// Serialize settings to TOML and write them to `path`.
pub fn save_settings(settings: &Settings, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(settings)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Server id detection ─────────────────────────────────────────────

/// Guess a server id from a server's working directory.
///
/// Inside a `plugins` tree the id is the directory holding `plugins`;
/// otherwise it is the directory's own name.
pub fn detect_server_id(dir: &Path) -> String {
    let from_plugins = dir.ancestors().find_map(|ancestor| {
        let name = ancestor.file_name()?.to_str()?;
        if name.eq_ignore_ascii_case("plugins") {
            ancestor.parent()?.file_name()?.to_str().map(str::to_owned)
        } else {
            None
        }
    });

    from_plugins
        .or_else(|| dir.file_name().and_then(|n| n.to_str()).map(str::to_owned))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "game-server".into())
}

// ── Validation & translation ────────────────────────────────────────

fn check_broker(section: &str, port: u16, channel: &str, prefix: &str) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(invalid(&format!("{section}.port"), "must be non-zero"));
    }
    if channel.trim().is_empty() {
        return Err(invalid(&format!("{section}.channel"), "must not be empty"));
    }
    if prefix.trim().is_empty() {
        return Err(invalid(&format!("{section}.prefix"), "must not be empty"));
    }
    Ok(())
}

impl Settings {
    /// Fresh settings for `server_id`.
    pub fn for_server(server_id: impl Into<String>) -> Self {
        let mut settings = Self::default();
        settings.websocket.server_id = server_id.into();
        settings
    }

    pub fn server_id(&self) -> &str {
        &self.websocket.server_id
    }

    /// Check everything a link needs before one is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = &self.websocket;
        if ws.server_id.trim().is_empty() || ws.server_id == UNKNOWN_SERVER_ID {
            return Err(invalid("websocket.server_id", "set a unique server id"));
        }
        if ws.auth_token.trim().is_empty() || ws.auth_token == PLACEHOLDER_TOKEN {
            return Err(invalid("websocket.auth_token", "set the token issued by the backend"));
        }
        if ws.port == 0 {
            return Err(invalid("websocket.port", "must be non-zero"));
        }
        if self.communication.reconnect_interval == 0 {
            return Err(invalid("communication.reconnect_interval", "must be non-zero"));
        }
        if self.heartbeat.timeout == 0 {
            return Err(invalid("heartbeat.timeout", "must be non-zero"));
        }
        if self.heartbeat.interval == 0 {
            return Err(invalid("heartbeat.interval", "must be non-zero"));
        }
        match self.communication.kind {
            Medium::Websocket => {}
            Medium::Redis => {
                let redis = &self.redis;
                if redis.database < 0 {
                    return Err(invalid("redis.database", "must not be negative"));
                }
                check_broker("redis", redis.port, &redis.channel, &redis.prefix)?;
            }
            Medium::Mqtt => {
                let mqtt = &self.mqtt;
                check_broker("mqtt", mqtt.port, &mqtt.channel, &mqtt.prefix)?;
            }
        }
        self.base_url().map(drop)
    }

    /// Backend HTTP root, e.g. `https://cloud.example.net:8080`.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let ws = &self.websocket;
        let scheme = if ws.use_https { "https" } else { "http" };
        let raw = format!("{scheme}://{}:{}", ws.host, ws.port);
        Url::parse(&raw).map_err(|e| invalid("websocket.host", format!("{raw}: {e}")))
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_interval: Duration::from_secs(self.communication.reconnect_interval),
            max_reconnect_attempts: self.communication.max_reconnect_attempts,
            heartbeat_timeout: self.heartbeat_timeout(),
        }
    }

    pub fn response_options(&self) -> ResponseOptions {
        ResponseOptions {
            include_players: self.heartbeat.send_player_count,
            include_performance: self.heartbeat.send_performance_data,
        }
    }

    fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.timeout)
    }

    /// Endpoint for the websocket, log and storage paths.
    pub fn stream_endpoint(&self) -> Result<StreamEndpoint, ConfigError> {
        let ws = &self.websocket;
        let tls = if ws.insecure {
            TlsVerification::DangerAcceptInvalid
        } else if let Some(ref ca) = ws.ca_cert {
            TlsVerification::CustomCa(ca.clone())
        } else {
            TlsVerification::SystemDefaults
        };

        let mut endpoint =
            StreamEndpoint::new(self.base_url()?, SecretString::from(ws.auth_token.clone()));
        endpoint.tls = tls;
        endpoint.request_timeout = self.heartbeat_timeout();
        Ok(endpoint)
    }

    /// Pub/sub endpoint over the `[redis]` section.
    pub fn redis_endpoint(&self) -> PubSubEndpoint {
        let section = &self.redis;
        let mut redis = pubsub::RedisSettings::new(section.host.clone(), section.port);
        redis.password = section.password.clone().map(SecretString::from);
        redis.database = section.database;
        redis.connect_timeout = self.heartbeat_timeout();

        let mut endpoint = PubSubEndpoint::new(Arc::new(RedisBroker::new(redis)));
        endpoint.shared_channel.clone_from(&section.channel);
        endpoint.channel_prefix.clone_from(&section.prefix);
        endpoint
    }

    /// Pub/sub endpoint over the `[mqtt]` section.
    pub fn mqtt_endpoint(&self) -> PubSubEndpoint {
        let section = &self.mqtt;
        let mut mqtt = pubsub::MqttSettings::new(
            section.host.clone(),
            section.port,
            format!("cloudlink-{}", self.server_id()),
        );
        mqtt.username.clone_from(&section.username);
        mqtt.password = section.password.clone().map(SecretString::from);
        mqtt.keep_alive = Duration::from_secs(section.keep_alive);
        mqtt.connect_timeout = self.heartbeat_timeout();

        let mut endpoint = PubSubEndpoint::new(Arc::new(MqttBroker::new(mqtt)));
        endpoint.shared_channel.clone_from(&section.channel);
        endpoint.channel_prefix.clone_from(&section.prefix);
        endpoint
    }

    /// Validate and build what `ConnectionController::new` takes.
    pub fn link_settings(&self) -> Result<LinkSettings, ConfigError> {
        self.validate()?;
        let endpoint = match self.communication.kind {
            Medium::Websocket => Endpoint::Stream(self.stream_endpoint()?),
            Medium::Redis => Endpoint::PubSub(self.redis_endpoint()),
            Medium::Mqtt => Endpoint::PubSub(self.mqtt_endpoint()),
        };
        let mut link = LinkSettings::new(self.server_id(), endpoint);
        link.response = self.response_options();
        Ok(link)
    }
}
