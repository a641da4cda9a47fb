//! MQTT implementation of [`Broker`].
//!
//! Each session holds two broker connections, one that only publishes and
//! one that only subscribes, each driven by its own event-loop task.
//! Neither loop reconnects on its own: the first error is reported as
//! [`SessionEvent::Lost`] and the loop exits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use super::{Broker, PubSubSession, Publisher, SESSION_EVENT_CAPACITY, SessionEvent, SessionPath};
use crate::error::Error;

/// Pending requests buffered per MQTT client.
const CLIENT_CAPACITY: usize = 64;

/// Connection parameters for an MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Base client id; the two connections append `-pub` / `-sub`.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(20),
        }
    }

    fn options(&self, suffix: &str) -> MqttOptions {
        let mut opts = MqttOptions::new(
            format!("{}-{suffix}", self.client_id),
            self.host.clone(),
            self.port,
        );
        opts.set_keep_alive(self.keep_alive);
        if let Some(ref username) = self.username {
            let password = self
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default();
            opts.set_credentials(username.clone(), password);
        }
        opts
    }
}

/// MQTT-backed [`Broker`].
#[derive(Debug, Clone)]
pub struct MqttBroker {
    settings: MqttSettings,
}

impl MqttBroker {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    async fn open_session(&self, channels: &[String]) -> Result<PubSubSession, Error> {
        let timeout = self.settings.connect_timeout;

        let (pub_client, mut pub_loop) =
            AsyncClient::new(self.settings.options("pub"), CLIENT_CAPACITY);
        await_connack(&mut pub_loop, timeout).await?;

        let (sub_client, mut sub_loop) =
            AsyncClient::new(self.settings.options("sub"), CLIENT_CAPACITY);
        if let Err(e) = await_connack(&mut sub_loop, timeout).await {
            let _ = pub_client.try_disconnect();
            return Err(e);
        }

        for channel in channels {
            sub_client
                .subscribe(channel.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| Error::Broker(format!("subscribe {channel}: {e}")))?;
        }

        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        tokio::spawn(pump(
            pub_loop,
            SessionPath::Publish,
            events_tx.clone(),
            VecDeque::new(),
        ));
        tokio::spawn(pump(
            sub_loop,
            SessionPath::Subscribe,
            events_tx,
            channels.iter().cloned().collect(),
        ));

        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            channels = ?channels,
            "MQTT session open"
        );

        Ok(PubSubSession {
            publisher: Arc::new(MqttPublisher {
                publish: pub_client,
                subscribe: sub_client,
            }),
            events: events_rx,
        })
    }
}

impl Broker for MqttBroker {
    fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.settings.host, self.settings.port)
    }

    fn open<'a>(&'a self, channels: &'a [String]) -> BoxFuture<'a, Result<PubSubSession, Error>> {
        Box::pin(self.open_session(channels))
    }
}

// ── Publisher ────────────────────────────────────────────────────────

struct MqttPublisher {
    publish: AsyncClient,
    subscribe: AsyncClient,
}

impl Publisher for MqttPublisher {
    fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        self.publish
            .try_publish(channel, QoS::AtLeastOnce, false, payload.to_owned())
            .map_err(|e| Error::Broker(format!("publish {channel}: {e}")))
    }

    fn close(&self) {
        let _ = self.publish.try_disconnect();
        let _ = self.subscribe.try_disconnect();
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Event loops ──────────────────────────────────────────────────────

async fn await_connack(eventloop: &mut EventLoop, timeout: Duration) -> Result<(), Error> {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(classify_connection_error(e)),
            }
        }
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: timeout.as_secs(),
        })?
}

/// Drive one connection until it fails, is closed, or nobody listens.
async fn pump(
    mut eventloop: EventLoop,
    path: SessionPath,
    events: mpsc::Sender<SessionEvent>,
    mut pending_subscriptions: VecDeque<String>,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => SessionEvent::Delivery {
                channel: p.topic,
                payload: String::from_utf8_lossy(&p.payload).into_owned(),
            },
            Ok(Event::Incoming(Packet::SubAck(_))) => match pending_subscriptions.pop_front() {
                Some(channel) => SessionEvent::Subscribed { channel },
                None => continue,
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!(%path, "MQTT connection closed locally");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(%path, error = %e, "MQTT connection lost");
                let _ = events
                    .send(SessionEvent::Lost {
                        path,
                        error: classify_connection_error(e),
                    })
                    .await;
                break;
            }
        };

        if events.send(event).await.is_err() {
            break;
        }
    }
}

fn classify_connection_error(err: ConnectionError) -> Error {
    match err {
        ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword) => {
            Error::Authentication {
                status: 401,
                message: "broker rejected username/password".into(),
            }
        }
        ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized) => {
            Error::Authentication {
                status: 403,
                message: "broker refused authorization".into(),
            }
        }
        other => Error::Broker(other.to_string()),
    }
}
