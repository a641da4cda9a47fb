// ── Pub/sub transport ──
//
// Shares a broker with every other node. Each session subscribes to the
// shared channel and to this node's own `{prefix}:{server_id}` channel;
// inbound traffic is filtered here, not by the broker. Heartbeat
// responses and shutdown notices go to the shared channel, log events to
// the node channel, server messages to the target's channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use cloudlink_api::protocol::ALL_SERVERS;
use cloudlink_api::pubsub::{Broker, PubSubSession, Publisher, SessionEvent};
use cloudlink_api::{HeartbeatResponse, Inbound, LogEvent, ServerMessage};

use super::link::Link;
use super::{Transport, TransportContext, TransportKind};
use crate::config::PubSubEndpoint;
use crate::error::LinkError;
use crate::event::{ChannelOperation, LifecycleEvent};
use crate::metrics::ResponseBuilder;
use crate::state::ConnectionState;

type ApiError = cloudlink_api::Error;

/// Broadcast-medium transport.
pub struct PubSubTransport {
    inner: Arc<PubSubInner>,
}

struct PubSubInner {
    link: Arc<Link>,
    broker: Arc<dyn Broker>,
    server_id: String,
    shared_channel: String,
    server_channel: String,
    channel_prefix: String,
    responder: Arc<ResponseBuilder>,
    session: Mutex<Option<ActiveSession>>,
}

/// Publish side of the open session. A failed publish is reported on
/// `faults` so the session task can tear down and reconnect.
struct ActiveSession {
    publisher: Arc<dyn Publisher>,
    faults: mpsc::UnboundedSender<String>,
}

impl std::fmt::Debug for PubSubTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubTransport")
            .field("broker", &self.inner.broker.endpoint())
            .field("shared_channel", &self.inner.shared_channel)
            .field("server_channel", &self.inner.server_channel)
            .field("state", &self.inner.link.state())
            .finish_non_exhaustive()
    }
}

impl PubSubTransport {
    pub fn new(server_id: &str, endpoint: &PubSubEndpoint, ctx: TransportContext) -> Self {
        Self {
            inner: Arc::new(PubSubInner {
                link: Link::new(TransportKind::PubSub, ctx.bus, ctx.scheduler, ctx.config),
                broker: Arc::clone(&endpoint.broker),
                server_id: server_id.to_owned(),
                shared_channel: endpoint.shared_channel.clone(),
                server_channel: endpoint.channel_for(server_id),
                channel_prefix: endpoint.channel_prefix.clone(),
                responder: ctx.responder,
                session: Mutex::new(None),
            }),
        }
    }
}

impl Transport for PubSubTransport {
    fn kind(&self) -> TransportKind {
        self.inner.link.kind()
    }

    fn state(&self) -> ConnectionState {
        self.inner.link.state()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.link.subscribe_state()
    }

    fn connect(&self) {
        if self.inner.link.begin_connect() {
            Arc::clone(&self.inner).start_session();
        }
    }

    fn disconnect(&self) {
        self.inner.link.shutdown("Manual disconnect", true);
    }

    fn release(&self) {
        self.inner.link.shutdown("Server shutdown", false);
    }

    fn send_heartbeat_response(&self, response: &HeartbeatResponse) -> Result<(), LinkError> {
        self.inner.send_response(response, true)
    }

    fn send_shutdown_notification(&self, response: &HeartbeatResponse) -> Result<(), LinkError> {
        // Goes out whenever a session is open, even mid-teardown.
        self.inner.send_response(response, false)
    }

    fn send_log_event(&self, event: &LogEvent) -> Result<(), LinkError> {
        let inner = &self.inner;
        let result = serde_json::to_string(event)
            .map_err(LinkError::from)
            .and_then(|json| inner.publish(&inner.server_channel, &json, true));

        if let Err(e) = &result {
            warn!(player = %event.player_name, action = %event.action, error = %e, "cannot publish log event");
        }
        inner.link.emit(LifecycleEvent::LogForwarded {
            player_name: event.player_name.clone(),
            uuid: event.uuid.clone(),
            action: event.action.clone(),
            forced: event.forced,
            success: result.is_ok(),
        });
        result
    }

    fn send_server_message(&self, message: &ServerMessage) -> Result<(), LinkError> {
        let inner = &self.inner;
        let channel = format!("{}:{}", inner.channel_prefix, message.target_id);
        let result = serde_json::to_string(message)
            .map_err(LinkError::from)
            .and_then(|json| inner.publish(&channel, &json, true));

        match &result {
            Ok(()) => debug!(%channel, message_type = %message.message_type, "server message published"),
            Err(e) => warn!(%channel, error = %e, "cannot publish server message"),
        }
        inner.link.emit(LifecycleEvent::ServerMessageSent {
            target: message.target_id.clone(),
            message_type: message.message_type.clone(),
            success: result.is_ok(),
        });
        result
    }
}

impl PubSubInner {
    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel_activity(&self, channel: &str, operation: ChannelOperation, payload: Option<&str>) {
        self.link.emit(LifecycleEvent::ChannelActivity {
            channel: channel.to_owned(),
            operation,
            payload: payload.map(str::to_owned),
        });
    }

    // ── Session ──────────────────────────────────────────────────────

    fn start_session(self: Arc<Self>) {
        let scheduler = self.link.scheduler().clone();
        if !scheduler.spawn(self.run_session()) {
            debug!("scheduler closed, pub/sub session not started");
        }
    }

    async fn run_session(self: Arc<Self>) {
        let config = self.link.config();
        let cancel = self.link.cancel_token().clone();
        let channels = [self.server_channel.clone(), self.shared_channel.clone()];

        info!(
            server_id = %self.server_id,
            broker = %self.broker.endpoint(),
            "opening pub/sub session"
        );
        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = tokio::time::timeout(config.heartbeat_timeout, self.broker.open(&channels)) => result,
        };
        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.report_open_failure(&e);
                self.lost(&e.to_string());
                return;
            }
            Err(_) => {
                let e = ApiError::Timeout {
                    timeout_secs: config.heartbeat_timeout.as_secs(),
                };
                warn!(error = %e, "broker did not accept the session in time");
                self.lost(&e.to_string());
                return;
            }
        };

        let PubSubSession {
            publisher,
            mut events,
        } = session;
        let (faults_tx, mut faults) = mpsc::unbounded_channel();
        *self.session() = Some(ActiveSession {
            publisher: Arc::clone(&publisher),
            faults: faults_tx,
        });

        if !self.link.mark_connected(&self.broker.endpoint()) {
            *self.session() = None;
            publisher.close();
            return;
        }

        let reason = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    *self.session() = None;
                    publisher.close();
                    for channel in &channels {
                        self.channel_activity(channel, ChannelOperation::Unsubscribe, None);
                    }
                    debug!("pub/sub session closed by client");
                    return;
                }
                Some(reason) = faults.recv() => break reason,
                event = events.recv() => match event {
                    Some(SessionEvent::Subscribed { channel }) => {
                        info!(%channel, "subscribed");
                        self.channel_activity(&channel, ChannelOperation::Subscribe, None);
                    }
                    Some(SessionEvent::Delivery { channel, payload }) => {
                        self.handle_delivery(&channel, &payload);
                    }
                    Some(SessionEvent::Lost { path, error }) => {
                        break format!("{path} path lost: {error}");
                    }
                    None => break "session closed by broker".to_owned(),
                },
            }
        };

        *self.session() = None;
        publisher.close();
        self.lost(&reason);
    }

    fn report_open_failure(&self, err: &ApiError) {
        warn!(broker = %self.broker.endpoint(), error = %err, "cannot open pub/sub session");
        if let ApiError::Authentication { status, message } = err {
            self.link.emit(LifecycleEvent::AuthenticationFailed {
                status: *status,
                message: message.clone(),
            });
        }
    }

    fn lost(self: &Arc<Self>, reason: &str) {
        let inner = Arc::clone(self);
        self.link
            .connection_lost(reason, move || inner.start_session());
    }

    // ── Inbound ──────────────────────────────────────────────────────

    fn handle_delivery(&self, channel: &str, payload: &str) {
        debug!(%channel, bytes = payload.len(), "message received");
        self.channel_activity(channel, ChannelOperation::MessageReceived, Some(payload));

        match Inbound::classify(payload) {
            Inbound::HeartbeatRequest(request) => {
                if !request.targets(&self.server_id) {
                    trace!(target_server_id = %request.server_id, "heartbeat request for another server");
                    return;
                }
                debug!(target_server_id = %request.server_id, "heartbeat request received");
                self.link.emit(LifecycleEvent::HeartbeatRequestReceived {
                    target_server_id: request.server_id.clone(),
                    raw: payload.to_owned(),
                });
                let response = self.responder.heartbeat_response(&request);
                // Failures are already logged and reported.
                let _ = self.send_response(&response, true);
            }
            Inbound::ServerMessage(message) => {
                if message.sender_id == self.server_id {
                    trace!("own server message echoed back");
                    return;
                }
                if message.target_id != self.server_id && message.target_id != ALL_SERVERS {
                    trace!(target_id = %message.target_id, "server message for another server");
                    return;
                }
                self.link.emit(LifecycleEvent::MessageReceived {
                    content: payload.to_owned(),
                    message_type: message.message_type,
                    sender: message.sender_id,
                });
            }
            Inbound::PeerReport { kind } => trace!(%kind, "peer report ignored"),
            Inbound::Opaque(content) => {
                self.link.emit(LifecycleEvent::MessageReceived {
                    content,
                    message_type: "unknown".into(),
                    sender: "unknown".into(),
                });
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Publish through the open session. With `require_connected`, the
    /// link must also be `Connected`.
    fn publish(&self, channel: &str, payload: &str, require_connected: bool) -> Result<(), LinkError> {
        if require_connected && !self.link.is_connected() {
            return Err(if self.link.state().is_terminal() {
                LinkError::ShutDown
            } else {
                LinkError::NotConnected
            });
        }
        let (publisher, faults) = {
            let session = self.session();
            let active = session.as_ref().ok_or(LinkError::NotConnected)?;
            (Arc::clone(&active.publisher), active.faults.clone())
        };

        if let Err(e) = publisher.publish(channel, payload) {
            let _ = faults.send(format!("publish to {channel} failed: {e}"));
            return Err(e.into());
        }
        self.channel_activity(channel, ChannelOperation::Publish, Some(payload));
        Ok(())
    }

    fn send_response(&self, response: &HeartbeatResponse, require_connected: bool) -> Result<(), LinkError> {
        let kind = response.kind;
        let result = serde_json::to_string(response)
            .map_err(LinkError::from)
            .and_then(|json| self.publish(&self.shared_channel, &json, require_connected));

        match &result {
            Ok(()) => debug!(kind = kind.as_str(), channel = %self.shared_channel, "response published"),
            Err(e) => warn!(kind = kind.as_str(), error = %e, "cannot publish response"),
        }
        self.link.emit(LifecycleEvent::HeartbeatResponseSent {
            kind,
            success: result.is_ok(),
            detail: result.as_ref().err().map(ToString::to_string),
        });
        result
    }
}
