//! Redis implementation of [`Broker`].
//!
//! Each session holds two connections: a multiplexed one for `PUBLISH`
//! and a dedicated pub/sub one for `SUBSCRIBE`. Publishes are queued and
//! written in order by the session's publish task. Neither task
//! reconnects: the first failure is reported as [`SessionEvent::Lost`].

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, ErrorKind, RedisConnectionInfo,
    RedisError,
};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{Broker, PubSubSession, Publisher, SESSION_EVENT_CAPACITY, SessionEvent, SessionPath};
use crate::error::Error;

pub const DEFAULT_PORT: u16 = 6379;

/// Connection parameters for a Redis server.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<SecretString>,
    /// Logical database selected on both connections.
    pub database: i64,
    pub connect_timeout: Duration,
}

impl RedisSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            database: 0,
            connect_timeout: Duration::from_secs(20),
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.database,
                password: self
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().to_owned())
                    .filter(|p| !p.is_empty()),
                ..RedisConnectionInfo::default()
            },
        }
    }
}

/// Redis-backed [`Broker`].
#[derive(Debug, Clone)]
pub struct RedisBroker {
    settings: RedisSettings,
}

impl RedisBroker {
    pub fn new(settings: RedisSettings) -> Self {
        Self { settings }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    async fn open_session(&self, channels: &[String]) -> Result<PubSubSession, Error> {
        let timeout = self.settings.connect_timeout;
        let client = Client::open(self.settings.connection_info()).map_err(classify_redis_error)?;

        let connecting = async {
            let publish = client.get_multiplexed_async_connection().await?;
            let mut subscribe = client.get_async_pubsub().await?;
            for channel in channels {
                subscribe.subscribe(channel.as_str()).await?;
            }
            Ok::<_, RedisError>((publish, subscribe))
        };
        let (publish, subscribe) = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(classify_redis_error)?;

        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        // SUBSCRIBE has already been acknowledged for every channel.
        for channel in channels {
            let _ = events_tx.try_send(SessionEvent::Subscribed {
                channel: channel.clone(),
            });
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let publisher_task = tokio::spawn(drain_queue(publish, queue_rx, events_tx.clone()));
        let subscriber_task = tokio::spawn(forward_messages(subscribe, events_tx));

        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            database = self.settings.database,
            channels = ?channels,
            "Redis session open"
        );

        Ok(PubSubSession {
            publisher: Arc::new(RedisPublisher {
                queue: queue_tx,
                tasks: [publisher_task.abort_handle(), subscriber_task.abort_handle()],
            }),
            events: events_rx,
        })
    }
}

impl Broker for RedisBroker {
    fn endpoint(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.settings.host, self.settings.port, self.settings.database
        )
    }

    fn open<'a>(&'a self, channels: &'a [String]) -> BoxFuture<'a, Result<PubSubSession, Error>> {
        Box::pin(self.open_session(channels))
    }
}

// ── Publisher ────────────────────────────────────────────────────────

struct RedisPublisher {
    queue: mpsc::UnboundedSender<(String, String)>,
    tasks: [AbortHandle; 2],
}

impl Publisher for RedisPublisher {
    fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        self.queue
            .send((channel.to_owned(), payload.to_owned()))
            .map_err(|_| Error::Broker(format!("publish {channel}: session closed")))
    }

    fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for RedisPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Session tasks ────────────────────────────────────────────────────

async fn drain_queue(
    mut conn: MultiplexedConnection,
    mut queue: mpsc::UnboundedReceiver<(String, String)>,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some((channel, payload)) = queue.recv().await {
        let sent: Result<i64, RedisError> = conn.publish(&channel, &payload).await;
        if let Err(e) = sent {
            tracing::warn!(%channel, error = %e, "Redis publish failed");
            let _ = events
                .send(SessionEvent::Lost {
                    path: SessionPath::Publish,
                    error: classify_redis_error(e),
                })
                .await;
            return;
        }
    }
}

async fn forward_messages(subscribe: PubSub, events: mpsc::Sender<SessionEvent>) {
    let mut messages = subscribe.into_on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = %e, "non-text Redis payload skipped");
                continue;
            }
        };
        let delivery = SessionEvent::Delivery {
            channel: message.get_channel_name().to_owned(),
            payload,
        };
        if events.send(delivery).await.is_err() {
            return;
        }
    }

    tracing::warn!("Redis subscription connection closed");
    let _ = events
        .send(SessionEvent::Lost {
            path: SessionPath::Subscribe,
            error: Error::Broker("subscription connection closed".into()),
        })
        .await;
}

fn classify_redis_error(err: RedisError) -> Error {
    let rejected = err.kind() == ErrorKind::AuthenticationFailed
        || matches!(err.code(), Some("NOAUTH" | "WRONGPASS"));
    if rejected {
        Error::Authentication {
            status: 401,
            message: err.to_string(),
        }
    } else {
        Error::Broker(err.to_string())
    }
}
