//! Server vitals and heartbeat response construction.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};

use cloudlink_api::{HeartbeatRequest, HeartbeatResponse, ResponseKind, ServerState};

/// Live server vitals, supplied by the host.
///
/// Called from transport tasks while answering heartbeats, so every
/// method must return quickly and must not block on the game loop.
pub trait MetricsSource: Send + Sync {
    fn tick_rate(&self) -> f64;

    /// CPU load in percent, `-1.0` if unknown.
    fn cpu_usage_pct(&self) -> f64;

    fn ram_usage_mb(&self) -> f64;

    fn players_online(&self) -> Vec<String>;

    fn max_players(&self) -> u32;

    fn server_state(&self) -> ServerState;

    fn is_running(&self) -> bool;

    fn start_time(&self) -> Option<DateTime<Utc>>;
}

/// Which optional sections heartbeat responses carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseOptions {
    /// Report the player roster. When off, `players_online` is empty.
    pub include_players: bool,
    /// Report tick rate, CPU and RAM. When off they read `0`, `-1`, `0`.
    pub include_performance: bool,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            include_players: true,
            include_performance: true,
        }
    }
}

/// Builds heartbeat responses from the registered [`MetricsSource`].
pub struct ResponseBuilder {
    server_id: String,
    options: ResponseOptions,
    source: RwLock<Option<Arc<dyn MetricsSource>>>,
}

impl std::fmt::Debug for ResponseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBuilder")
            .field("server_id", &self.server_id)
            .field("options", &self.options)
            .field("has_source", &self.has_source())
            .finish()
    }
}

impl ResponseBuilder {
    pub fn new(server_id: impl Into<String>, options: ResponseOptions) -> Self {
        Self {
            server_id: server_id.into(),
            options,
            source: RwLock::new(None),
        }
    }

    pub fn set_source(&self, source: Arc<dyn MetricsSource>) {
        *self.source.write().unwrap_or_else(PoisonError::into_inner) = Some(source);
    }

    pub fn clear_source(&self) {
        *self.source.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_source(&self) -> bool {
        self.source().is_some()
    }

    fn source(&self) -> Option<Arc<dyn MetricsSource>> {
        self.source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Answer `request`. Without a source the reply is an all-zero OFFLINE snapshot.
    pub fn heartbeat_response(&self, request: &HeartbeatRequest) -> HeartbeatResponse {
        let mut response = self.offline(ResponseKind::HeartbeatResponse, request.timestamp.clone());

        let Some(source) = self.source() else {
            tracing::debug!("no metrics source registered, answering OFFLINE");
            return response;
        };

        response.server_state = source.server_state();
        response.is_running = source.is_running();
        response.max_players = source.max_players();
        response.start_time = source.start_time();
        if self.options.include_performance {
            response.tps = source.tick_rate();
            response.cpu_usage = source.cpu_usage_pct();
            response.ram_usage_mb = source.ram_usage_mb();
        } else {
            response.cpu_usage = -1.0;
        }
        if self.options.include_players {
            response.players_online = source.players_online();
        }
        response
    }

    /// Final notice: OFFLINE, not running, zeroed vitals, empty roster.
    ///
    /// Only `max_players` is taken from the source, so the backend keeps
    /// showing the slot capacity of the stopped server.
    pub fn shutdown_notification(&self) -> HeartbeatResponse {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut response = self.offline(ResponseKind::ShutdownNotification, now);
        response.max_players = self.source().map_or(0, |s| s.max_players());
        response
    }

    fn offline(&self, kind: ResponseKind, request_timestamp: String) -> HeartbeatResponse {
        HeartbeatResponse {
            kind,
            server_id: self.server_id.clone(),
            request_timestamp,
            response_timestamp: Utc::now(),
            server_state: ServerState::Offline,
            is_running: false,
            tps: 0.0,
            cpu_usage: 0.0,
            ram_usage_mb: 0.0,
            players_online: Vec::new(),
            max_players: 0,
            start_time: None,
        }
    }
}
