//! WebSocket dialer for the stream transport.
//!
//! The backend exposes one socket per node at `{base}/ws/{server_id}/{auth_token}`,
//! with the HTTP scheme swapped for its websocket counterpart. Reading,
//! writing and reconnection are left to the caller; this module only
//! builds the URL, performs the upgrade and classifies handshake failures.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::Error;

/// A connected client socket.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reason sent with the normal close frame on a deliberate disconnect.
pub const CLIENT_DISCONNECT_REASON: &str = "Client disconnect";

/// Build the socket URL for `server_id` from the backend's HTTP base URL.
pub fn stream_url(base: &Url, server_id: &str, auth_token: &SecretString) -> Result<Url, Error> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(Error::WebSocketConnect(format!(
                "unsupported scheme '{other}' in {base}"
            )));
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|()| Error::WebSocketConnect(format!("cannot use scheme {scheme} for {base}")))?;
    url.path_segments_mut()
        .map_err(|()| Error::WebSocketConnect(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(["ws", server_id, auth_token.expose_secret()]);
    Ok(url)
}

/// Perform the websocket upgrade, bounded by `timeout`.
pub async fn connect(url: &Url, timeout: Duration) -> Result<WsStream, Error> {
    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let request = ClientRequestBuilder::new(uri);
    let (ws_stream, response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(classify_handshake_error)?;

    tracing::debug!(status = %response.status(), "WebSocket upgrade accepted");
    Ok(ws_stream)
}

/// The close frame sent when we hang up on purpose.
pub fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: CLIENT_DISCONNECT_REASON.into(),
    }))
}

/// Error describing a close frame received from the backend.
pub fn closed_by_remote(frame: Option<&CloseFrame>) -> Error {
    frame.map_or_else(
        || Error::WebSocketClosed {
            code: 1005,
            reason: "no close frame".into(),
        },
        |cf| Error::WebSocketClosed {
            code: u16::from(cf.code),
            reason: cf.reason.to_string(),
        },
    )
}

fn classify_handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let message = status.canonical_reason().unwrap_or("rejected").to_owned();
            if matches!(status.as_u16(), 401 | 403) {
                Error::Authentication {
                    status: status.as_u16(),
                    message,
                }
            } else {
                Error::WebSocketConnect(format!("HTTP {}: {message}", status.as_u16()))
            }
        }
        tungstenite::Error::Tls(e) => Error::Tls(e.to_string()),
        other => Error::WebSocketConnect(other.to_string()),
    }
}
