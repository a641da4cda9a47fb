// ── Connection controller ──
//
// Transport-agnostic façade the host talks to. Owns the connection
// tuning, the response builder and the scheduler, builds the transport
// selected by the settings, and keeps connectivity failures away from the
// caller: they surface as events and log lines only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use cloudlink_api::{HeartbeatRequest, HeartbeatResponse, LogEvent, ResponseKind, ServerMessage};

use crate::bus::EventBus;
use crate::config::{ConnectionConfig, LinkSettings, SharedConfig};
use crate::error::LinkError;
use crate::event::{LifecycleEvent, Observer};
use crate::metrics::{MetricsSource, ResponseBuilder};
use crate::scheduler::Scheduler;
use crate::state::ConnectionState;
use crate::transport::{self, Transport, TransportContext, TransportKind};

/// Pause after the shutdown notice so it can leave before teardown.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);
/// Upper bound for background tasks to stop once shutdown cancels them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The host's handle on the cloud link.
///
/// Cheaply cloneable. Send operations never fail towards the caller:
/// problems are logged and reported through the [`EventBus`].
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    settings: LinkSettings,
    config: SharedConfig,
    responder: Arc<ResponseBuilder>,
    bus: EventBus,
    scheduler: Scheduler,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("server_id", &self.inner.settings.server_id)
            .field("transport", &self.transport_kind())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionController {
    /// Create a controller with a fresh [`EventBus`]. Does not connect.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime. See [`Self::try_new`].
    pub fn new(settings: LinkSettings, config: ConnectionConfig) -> Self {
        let bus = EventBus::new(settings.server_id.as_str());
        Self::with_event_bus(settings, config, bus)
    }

    /// Like [`Self::new`], but fails with [`LinkError::NoRuntime`] outside
    /// a Tokio runtime.
    pub fn try_new(settings: LinkSettings, config: ConnectionConfig) -> Result<Self, LinkError> {
        let scheduler = Scheduler::try_new()?;
        let bus = EventBus::new(settings.server_id.as_str());
        Ok(Self::assemble(settings, config, bus, scheduler))
    }

    /// Create a controller that reports on an existing bus.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_event_bus(settings: LinkSettings, config: ConnectionConfig, bus: EventBus) -> Self {
        Self::assemble(settings, config, bus, Scheduler::new())
    }

    fn assemble(
        settings: LinkSettings,
        config: ConnectionConfig,
        bus: EventBus,
        scheduler: Scheduler,
    ) -> Self {
        let responder = Arc::new(ResponseBuilder::new(
            settings.server_id.clone(),
            settings.response,
        ));
        Self {
            inner: Arc::new(ControllerInner {
                settings,
                config: Arc::new(ArcSwap::from_pointee(config)),
                responder,
                bus,
                scheduler,
                transport: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn server_id(&self) -> &str {
        &self.inner.settings.server_id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.settings.endpoint.kind()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Current tuning.
    pub fn connection_config(&self) -> Arc<ConnectionConfig> {
        self.inner.config.load_full()
    }

    /// State of the current transport. `Disconnected` when there is none.
    pub fn state(&self) -> ConnectionState {
        self.current_transport()
            .map_or(ConnectionState::Disconnected, |t| t.state())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch the current transport's state. `None` before the first `connect()`.
    pub fn subscribe_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.current_transport().map(|t| t.subscribe_state())
    }

    fn transport_slot(&self) -> MutexGuard<'_, Option<Arc<dyn Transport>>> {
        self.inner
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport_slot().clone()
    }

    fn emit(&self, event: LifecycleEvent) -> bool {
        self.inner.bus.emit(self.transport_kind(), event)
    }

    // ── Setup ────────────────────────────────────────────────────────

    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.inner.bus.register(observer);
    }

    pub fn set_metrics_source(&self, source: Arc<dyn MetricsSource>) {
        self.inner.responder.set_source(source);
    }

    pub fn clear_metrics_source(&self) {
        self.inner.responder.clear_source();
    }

    /// Applies from the next reconnect decision on. A retry already
    /// waiting on its timer keeps the old delay.
    pub fn set_reconnect_interval(&self, interval: Duration) {
        self.update_config(|c| c.reconnect_interval = interval);
    }

    /// Applies from the next reconnect decision on.
    pub fn set_max_reconnect_attempts(&self, attempts: u32) {
        self.update_config(|c| c.max_reconnect_attempts = attempts);
    }

    /// Applies from the next dial on.
    pub fn set_heartbeat_timeout(&self, timeout: Duration) {
        self.update_config(|c| c.heartbeat_timeout = timeout);
    }

    fn update_config(&self, apply: impl Fn(&mut ConnectionConfig)) {
        self.inner.config.rcu(|current| {
            let mut next = ConnectionConfig::clone(current);
            apply(&mut next);
            next
        });
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start connecting. No-op while a connection is open, opening or
    /// scheduled. Fails only if the endpoint is unusable or the
    /// controller was shut down.
    pub fn connect(&self) -> Result<(), LinkError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            warn!("connect() after shutdown ignored");
            return Err(LinkError::ShutDown);
        }

        let transport = {
            let mut slot = self.transport_slot();
            match slot.as_ref() {
                Some(existing) if !existing.state().is_terminal() => Arc::clone(existing),
                _ => {
                    let ctx = TransportContext {
                        bus: self.inner.bus.clone(),
                        scheduler: self.inner.scheduler.clone(),
                        responder: Arc::clone(&self.inner.responder),
                        config: Arc::clone(&self.inner.config),
                    };
                    let built = transport::build(&self.inner.settings, ctx)?;
                    *slot = Some(Arc::clone(&built));
                    built
                }
            }
        };

        let state = transport.state();
        if state != ConnectionState::Disconnected {
            debug!(%state, "connect() ignored");
            return Ok(());
        }

        info!(
            server_id = %self.server_id(),
            transport = %transport.kind(),
            "connecting to cloud"
        );
        transport.connect();
        Ok(())
    }

    /// Tear down the current transport. A later `connect()` builds a new one.
    pub fn disconnect(&self) {
        let taken = self.transport_slot().take();
        match taken {
            Some(transport) => {
                info!(transport = %transport.kind(), "disconnecting from cloud");
                transport.disconnect();
            }
            None => debug!("disconnect() without a transport"),
        }
    }

    /// Send the shutdown notice, give it a moment to leave, then stop
    /// every task. Runs once; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            debug!("shutdown already ran");
            return;
        }
        info!(server_id = %self.server_id(), "shutting down cloud link");

        let sent = self.send_shutdown_notification();
        self.emit(LifecycleEvent::ShutdownNotified {
            reason: "Server shutdown".into(),
            graceful: sent,
        });
        if sent {
            tokio::time::sleep(SHUTDOWN_FLUSH).await;
        }

        let taken = self.transport_slot().take();
        if let Some(transport) = taken {
            transport.release();
        }
        if !self.inner.scheduler.shutdown(SHUTDOWN_GRACE).await {
            warn!("background tasks did not stop in time and were aborted");
        }
    }

    // ── Sends ────────────────────────────────────────────────────────

    /// Forward one player-activity record. Never fails towards the caller.
    pub fn send_log_event(&self, player_name: &str, uuid: &str, action: &str, forced: bool) {
        let event = LogEvent::new(player_name, uuid, action, forced);
        let Some(transport) = self.current_transport() else {
            warn!(player = player_name, action, "cannot forward log event, not connected");
            self.emit(LifecycleEvent::LogForwarded {
                player_name: event.player_name,
                uuid: event.uuid,
                action: event.action,
                forced,
                success: false,
            });
            return;
        };
        if let Err(e) = transport.send_log_event(&event) {
            debug!(error = %e, "log event not forwarded");
        }
    }

    /// Answer `request` with a response built from the metrics source.
    pub fn send_heartbeat_response(&self, request: &HeartbeatRequest) {
        let response = self.heartbeat_response(request);
        let Some(transport) = self.current_transport() else {
            self.report_unsent(ResponseKind::HeartbeatResponse);
            return;
        };
        if let Err(e) = transport.send_heartbeat_response(&response) {
            debug!(error = %e, "heartbeat response not sent");
        }
    }

    /// Send the OFFLINE notice. Returns whether it was handed to the wire.
    pub fn send_shutdown_notification(&self) -> bool {
        let notice = self.shutdown_notification();
        let Some(transport) = self.current_transport() else {
            self.report_unsent(ResponseKind::ShutdownNotification);
            return false;
        };
        match transport.send_shutdown_notification(&notice) {
            Ok(()) => {
                info!("shutdown notification sent");
                true
            }
            Err(e) => {
                warn!(error = %e, "shutdown notification not sent");
                false
            }
        }
    }

    /// Address another node (or `"all"`). Pub/sub transport only.
    pub fn send_server_message(&self, target: &str, message_type: &str, payload: Value) {
        let message = ServerMessage::new(self.server_id(), target, message_type, payload);
        let result = match self.current_transport() {
            Some(transport) => transport.send_server_message(&message),
            None => Err(LinkError::NotConnected),
        };

        match result {
            Ok(()) => {}
            // The transport reported this one itself.
            Err(e) if e.is_transport_failure() => debug!(error = %e, "server message not sent"),
            Err(e) => {
                warn!(target, message_type, error = %e, "server message not sent");
                self.emit(LifecycleEvent::ServerMessageSent {
                    target: target.to_owned(),
                    message_type: message_type.to_owned(),
                    success: false,
                });
            }
        }
    }

    fn report_unsent(&self, kind: ResponseKind) {
        warn!(kind = kind.as_str(), "cannot send, not connected");
        self.emit(LifecycleEvent::HeartbeatResponseSent {
            kind,
            success: false,
            detail: Some(LinkError::NotConnected.to_string()),
        });
    }

    // ── Response construction ────────────────────────────────────────

    pub fn heartbeat_response(&self, request: &HeartbeatRequest) -> HeartbeatResponse {
        self.inner.responder.heartbeat_response(request)
    }

    pub fn shutdown_notification(&self) -> HeartbeatResponse {
        self.inner.responder.shutdown_notification()
    }
}
