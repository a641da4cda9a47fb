// ── Stream transport ──
//
// One websocket to `{base}/ws/{server_id}/{token}`. A session task owns
// the socket: it reads frames, answers heartbeat requests and drains the
// outbound queue, so responses leave in the order their requests were
// handled. Log events bypass the socket and go out as HTTP POSTs on their
// own tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use cloudlink_api::websocket::{self, CLIENT_DISCONNECT_REASON};
use cloudlink_api::{BackendClient, HeartbeatResponse, Inbound, LogEvent};

use super::link::Link;
use super::{Transport, TransportContext, TransportKind};
use crate::config::StreamEndpoint;
use crate::error::LinkError;
use crate::event::{LifecycleEvent, StreamStatusKind};
use crate::metrics::ResponseBuilder;
use crate::state::ConnectionState;

type ApiError = cloudlink_api::Error;

/// Close code for a connection that dropped without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;
const SWITCHING_PROTOCOLS: u16 = 101;
const NORMAL_CLOSURE: u16 = 1000;

/// Point-to-point websocket transport.
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    link: Arc<Link>,
    server_id: String,
    url: Url,
    /// `url` with the token masked, for logs and events.
    endpoint: String,
    backend: BackendClient,
    responder: Arc<ResponseBuilder>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.inner.link.state())
            .finish_non_exhaustive()
    }
}

impl StreamTransport {
    pub fn new(
        server_id: &str,
        endpoint: &StreamEndpoint,
        ctx: TransportContext,
    ) -> Result<Self, LinkError> {
        let url = websocket::stream_url(&endpoint.base_url, server_id, &endpoint.auth_token)?;
        let masked = websocket::stream_url(
            &endpoint.base_url,
            server_id,
            &SecretString::from("***".to_owned()),
        )?;
        let backend = BackendClient::new(
            endpoint.base_url.clone(),
            server_id,
            endpoint.auth_token.clone(),
            &endpoint.tls.to_transport(endpoint.request_timeout),
        )?;

        Ok(Self {
            inner: Arc::new(StreamInner {
                link: Link::new(TransportKind::Stream, ctx.bus, ctx.scheduler, ctx.config),
                server_id: server_id.to_owned(),
                url,
                endpoint: masked.to_string(),
                backend,
                responder: ctx.responder,
                outbound: Mutex::new(None),
            }),
        })
    }
}

impl Transport for StreamTransport {
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
        self.inner.send_response(response)
    }

    fn send_shutdown_notification(&self, response: &HeartbeatResponse) -> Result<(), LinkError> {
        self.inner.send_response(response)
    }

    fn send_log_event(&self, event: &LogEvent) -> Result<(), LinkError> {
        Arc::clone(&self.inner).post_log(event.clone())
    }
}

impl StreamInner {
    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self, status: StreamStatusKind, code: u16, details: impl Into<String>) {
        self.link.emit(LifecycleEvent::StreamStatus {
            status,
            code,
            details: details.into(),
        });
    }

    // ── Session ──────────────────────────────────────────────────────

    fn start_session(self: Arc<Self>) {
        let scheduler = self.link.scheduler().clone();
        if !scheduler.spawn(self.run_session()) {
            debug!("scheduler closed, websocket session not started");
        }
    }

    async fn run_session(self: Arc<Self>) {
        let config = self.link.config();
        let cancel = self.link.cancel_token().clone();

        info!(server_id = %self.server_id, endpoint = %self.endpoint, "connecting websocket");
        let dialed = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = websocket::connect(&self.url, config.heartbeat_timeout) => result,
        };
        let ws = match dialed {
            Ok(ws) => ws,
            Err(e) => {
                self.report_dial_failure(&e);
                self.lost(&e.to_string());
                return;
            }
        };

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.outbound() = Some(tx);

        if !self.link.mark_connected(&self.endpoint) {
            *self.outbound() = None;
            let _ = sink.send(websocket::normal_close()).await;
            return;
        }
        self.status(
            StreamStatusKind::Open,
            SWITCHING_PROTOCOLS,
            "WebSocket connection established",
        );

        let loss = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    *self.outbound() = None;
                    while let Ok(message) = rx.try_recv() {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    if let Err(e) = sink.send(websocket::normal_close()).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    self.status(StreamStatusKind::Closed, NORMAL_CLOSURE, CLIENT_DISCONNECT_REASON);
                    debug!("websocket closed by client");
                    return;
                }
                Some(message) = rx.recv() => {
                    if let Err(e) = sink.send(message).await {
                        break ApiError::WebSocketClosed {
                            code: ABNORMAL_CLOSURE,
                            reason: format!("write failed: {e}"),
                        };
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        break websocket::closed_by_remote(frame.as_ref());
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => trace!("keepalive frame"),
                    Some(Ok(_)) => trace!("ignoring non-text frame"),
                    Some(Err(e)) => {
                        break ApiError::WebSocketClosed {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break ApiError::WebSocketClosed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".into(),
                        };
                    }
                },
            }
        };

        *self.outbound() = None;
        let code = match &loss {
            ApiError::WebSocketClosed { code, .. } => *code,
            _ => ABNORMAL_CLOSURE,
        };
        self.status(StreamStatusKind::Closed, code, loss.to_string());
        self.lost(&loss.to_string());
    }

    fn report_dial_failure(&self, err: &ApiError) {
        let mut code = 0;
        if let ApiError::Authentication { status, message } = err {
            warn!(status, "backend rejected the server credentials");
            code = *status;
            self.link.emit(LifecycleEvent::AuthenticationFailed {
                status: *status,
                message: message.clone(),
            });
        }
        self.status(StreamStatusKind::Error, code, err.to_string());
    }

    fn lost(self: &Arc<Self>, reason: &str) {
        let inner = Arc::clone(self);
        self.link
            .connection_lost(reason, move || inner.start_session());
    }

    // ── Inbound ──────────────────────────────────────────────────────

    fn handle_text(&self, text: &str) {
        match Inbound::classify(text) {
            Inbound::HeartbeatRequest(request) => {
                debug!(target_server_id = %request.server_id, "heartbeat request received");
                self.link.emit(LifecycleEvent::HeartbeatRequestReceived {
                    target_server_id: request.server_id.clone(),
                    raw: text.to_owned(),
                });
                let response = self.responder.heartbeat_response(&request);
                // Failures are already logged and reported.
                let _ = self.send_response(&response);
            }
            Inbound::ServerMessage(message) => {
                self.link.emit(LifecycleEvent::MessageReceived {
                    content: text.to_owned(),
                    message_type: message.message_type,
                    sender: message.sender_id,
                });
            }
            Inbound::PeerReport { kind } => {
                self.link.emit(LifecycleEvent::MessageReceived {
                    content: text.to_owned(),
                    message_type: kind,
                    sender: "unknown".into(),
                });
            }
            Inbound::Opaque(content) => {
                info!(%content, "backend message");
                self.link.emit(LifecycleEvent::MessageReceived {
                    content,
                    message_type: "unknown".into(),
                    sender: "unknown".into(),
                });
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────

    fn enqueue(&self, text: String) -> Result<(), LinkError> {
        if self.link.state().is_terminal() {
            return Err(LinkError::ShutDown);
        }
        if !self.link.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let outbound = self.outbound();
        let tx = outbound.as_ref().ok_or(LinkError::NotConnected)?;
        tx.send(Message::text(text))
            .map_err(|_| LinkError::NotConnected)
    }

    fn send_response(&self, response: &HeartbeatResponse) -> Result<(), LinkError> {
        let kind = response.kind;
        let result = serde_json::to_string(response)
            .map_err(LinkError::from)
            .and_then(|text| self.enqueue(text));

        match &result {
            Ok(()) => {
                debug!(kind = kind.as_str(), "response queued");
                self.link.emit(LifecycleEvent::HeartbeatResponseSent {
                    kind,
                    success: true,
                    detail: None,
                });
                self.status(StreamStatusKind::MessageSent, 0, kind.as_str());
            }
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "cannot send response");
                self.link.emit(LifecycleEvent::HeartbeatResponseSent {
                    kind,
                    success: false,
                    detail: Some(e.to_string()),
                });
                self.status(StreamStatusKind::MessageFailed, 0, e.to_string());
            }
        }
        result
    }

    fn post_log(self: Arc<Self>, event: LogEvent) -> Result<(), LinkError> {
        if !self.link.is_connected() {
            warn!(player = %event.player_name, action = %event.action, "cannot forward log event, not connected");
            self.emit_log_forwarded(&event, false);
            return Err(LinkError::NotConnected);
        }

        let inner = Arc::clone(&self);
        let posted = event.clone();
        let spawned = self.link.scheduler().spawn(async move {
            let success = match inner.backend.post_log(&posted).await {
                Ok(()) => {
                    debug!(player = %posted.player_name, action = %posted.action, "log event forwarded");
                    true
                }
                Err(e) => {
                    warn!(player = %posted.player_name, error = %e, "log event rejected");
                    if let ApiError::Authentication { status, message } = &e {
                        inner.link.emit(LifecycleEvent::AuthenticationFailed {
                            status: *status,
                            message: message.clone(),
                        });
                    }
                    false
                }
            };
            inner.emit_log_forwarded(&posted, success);
        });
        if spawned {
            Ok(())
        } else {
            self.emit_log_forwarded(&event, false);
            Err(LinkError::ShutDown)
        }
    }

    fn emit_log_forwarded(&self, event: &LogEvent, success: bool) {
        self.link.emit(LifecycleEvent::LogForwarded {
            player_name: event.player_name.clone(),
            uuid: event.uuid.clone(),
            action: event.action.clone(),
            forced: event.forced,
            success,
        });
    }
}
