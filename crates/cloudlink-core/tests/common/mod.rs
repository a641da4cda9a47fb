// Shared fixtures for the cloudlink-core integration tests.
#![allow(clippy::unwrap_used, dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{self, BoxFuture};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use url::Url;

use cloudlink_api::Error;
use cloudlink_api::pubsub::{
    Broker, PubSubSession, Publisher, SESSION_EVENT_CAPACITY, SessionEvent, SessionPath,
};
use cloudlink_core::{Event, LifecycleEvent, MetricsSource, ServerState, Verdict};

// ── Event recorder ──────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn attach(bus: &cloudlink_core::EventBus) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.events);
        bus.register_fn(move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
            Verdict::Allow
        });
        recorder
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<LifecycleEvent> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.kinds().iter().filter(|k| k.name() == name).count()
    }

    /// Poll until `done` holds, failing the test after five seconds.
    pub async fn wait_for(&self, what: &str, done: impl Fn(&[LifecycleEvent]) -> bool) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if done(&self.kinds()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {what}: {:#?}", self.kinds());
    }

    pub async fn wait_for_count(&self, name: &str, count: usize) {
        self.wait_for(name, |kinds| {
            kinds.iter().filter(|k| k.name() == name).count() >= count
        })
        .await;
    }
}

// ── Metrics ─────────────────────────────────────────────────────────

pub struct FixedMetrics;

impl MetricsSource for FixedMetrics {
    fn tick_rate(&self) -> f64 {
        20.0
    }
    fn cpu_usage_pct(&self) -> f64 {
        12.5
    }
    fn ram_usage_mb(&self) -> f64 {
        512.0
    }
    fn players_online(&self) -> Vec<String> {
        vec!["Steve".into(), "Alex".into()]
    }
    fn max_players(&self) -> u32 {
        50
    }
    fn server_state(&self) -> ServerState {
        ServerState::Online
    }
    fn is_running(&self) -> bool {
        true
    }
    fn start_time(&self) -> Option<DateTime<Utc>> {
        "2024-01-01T00:00:00Z".parse().ok()
    }
}

pub fn heartbeat_request(server_id: &str) -> String {
    heartbeat_request_at(server_id, "2024-01-01T00:00:00Z")
}

pub fn heartbeat_request_at(server_id: &str, timestamp: &str) -> String {
    format!(
        r#"{{"type":"heartbeat_request","server_id":"{server_id}","timestamp":"{timestamp}"}}"#
    )
}

// ── In-memory broker ────────────────────────────────────────────────

#[derive(Default)]
struct BrokerState {
    opens: u32,
    failing: bool,
    published: Vec<(String, String)>,
    session: Option<mpsc::Sender<SessionEvent>>,
}

/// Broker that keeps everything in process. Subscriptions are confirmed
/// immediately; deliveries are injected by the test.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every later `open`.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().unwrap().opens
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_on(&self, channel: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| serde_json::from_str(&payload).unwrap())
            .collect()
    }

    pub fn deliver(&self, channel: &str, payload: &str) {
        let tx = self.state.lock().unwrap().session.clone().unwrap();
        tx.try_send(SessionEvent::Delivery {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        })
        .unwrap();
    }

    /// Kill the subscribe half of the open session.
    pub fn drop_session(&self) {
        let tx = self.state.lock().unwrap().session.take().unwrap();
        tx.try_send(SessionEvent::Lost {
            path: SessionPath::Subscribe,
            error: Error::Broker("connection reset".into()),
        })
        .unwrap();
    }
}

impl Broker for MemoryBroker {
    fn endpoint(&self) -> String {
        "memory://broker".into()
    }

    fn open<'a>(&'a self, channels: &'a [String]) -> BoxFuture<'a, Result<PubSubSession, Error>> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        if state.failing {
            return Box::pin(future::ready(Err(Error::Broker("connection refused".into()))));
        }

        let (tx, events) = mpsc::channel(SESSION_EVENT_CAPACITY);
        for channel in channels {
            tx.try_send(SessionEvent::Subscribed {
                channel: channel.clone(),
            })
            .unwrap();
        }
        state.session = Some(tx);

        let publisher = Arc::new(MemoryPublisher {
            state: Arc::clone(&self.state),
        });
        Box::pin(future::ready(Ok(PubSubSession { publisher, events })))
    }
}

struct MemoryPublisher {
    state: Arc<Mutex<BrokerState>>,
}

impl Publisher for MemoryPublisher {
    fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .published
            .push((channel.to_owned(), payload.to_owned()));
        Ok(())
    }

    fn close(&self) {}
}

// ── Local backend: websocket + HTTP on one port ─────────────────────

/// Test double for the backend. Websocket upgrades are handed to the test
/// through `next_socket`; plain HTTP requests are answered `200` and
/// recorded as `(path, body)`.
pub struct TestBackend {
    pub addr: SocketAddr,
    pub upgrade_paths: Arc<Mutex<Vec<String>>>,
    pub http_requests: Arc<Mutex<Vec<(String, String)>>>,
    sockets: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
}

impl TestBackend {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Reject every websocket upgrade with `status`.
    pub async fn rejecting(status: u16) -> Self {
        Self::start_with(Some(status)).await
    }

    async fn start_with(reject: Option<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upgrade_paths = Arc::new(Mutex::new(Vec::new()));
        let http_requests = Arc::new(Mutex::new(Vec::new()));
        let (socket_tx, sockets) = mpsc::unbounded_channel();

        let paths = Arc::clone(&upgrade_paths);
        let requests = Arc::clone(&http_requests);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let paths = Arc::clone(&paths);
                let requests = Arc::clone(&requests);
                let socket_tx = socket_tx.clone();
                tokio::spawn(async move {
                    let mut head = [0_u8; 2048];
                    let n = tcp.peek(&mut head).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&head[..n]).to_ascii_lowercase();
                    if head.contains("upgrade: websocket") {
                        accept_upgrade(tcp, reject, &paths, &socket_tx).await;
                    } else {
                        answer_http(tcp, &requests).await;
                    }
                });
            }
        });

        Self {
            addr,
            upgrade_paths,
            http_requests,
            sockets,
        }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub async fn next_socket(&mut self) -> WebSocketStream<TcpStream> {
        tokio::time::timeout(Duration::from_secs(5), self.sockets.recv())
            .await
            .expect("no websocket connection within 5s")
            .unwrap()
    }

    pub fn http_requests(&self) -> Vec<(String, String)> {
        self.http_requests.lock().unwrap().clone()
    }
}

async fn accept_upgrade(
    tcp: TcpStream,
    reject: Option<u16>,
    paths: &Mutex<Vec<String>>,
    sockets: &mpsc::UnboundedSender<WebSocketStream<TcpStream>>,
) {
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        paths.lock().unwrap().push(request.uri().path().to_owned());
        match reject {
            Some(status) => {
                let mut denied = ErrorResponse::new(Some("denied".into()));
                *denied.status_mut() = StatusCode::from_u16(status).unwrap();
                Err(denied)
            }
            None => Ok(response),
        }
    };
    if let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await {
        let _ = sockets.send(ws);
    }
}

async fn answer_http(mut tcp: TcpStream, requests: &Mutex<Vec<(String, String)>>) {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    let header_end = loop {
        let n = tcp.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = tcp.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let path = head.split_whitespace().nth(1).unwrap_or_default().to_owned();
    let end = buf.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buf[header_end..end]).to_string();
    requests.lock().unwrap().push((path, body));

    let _ = tcp
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
        .await;
}
