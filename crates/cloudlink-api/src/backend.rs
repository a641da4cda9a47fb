// Backend REST client
//
// Wraps `reqwest::Client` with the backend's credential-in-path URL scheme
// (`{base}/api/{family}/{server_id}/{auth_token}`). Carries the log path
// of the stream transport and the storage facade.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::protocol::LogEvent;
use crate::transport::TransportConfig;

/// Operation carried in a storage request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageAction {
    Store,
    Get,
    Delete,
}

#[derive(Serialize)]
struct StorageRequest<'a> {
    action: StorageAction,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

/// HTTP client for the backend's per-server REST endpoints.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
    server_id: String,
    auth_token: SecretString,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url.as_str())
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

impl BackendClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `base_url` is the backend root, e.g. `https://cloud.example.net:8080`.
    pub fn new(
        base_url: Url,
        server_id: impl Into<String>,
        auth_token: SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url, server_id, auth_token))
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        base_url: Url,
        server_id: impl Into<String>,
        auth_token: SecretString,
    ) -> Self {
        Self {
            http,
            base_url,
            server_id: server_id.into(),
            auth_token,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// `{base}/api/{family}/{server_id}/{auth_token}`
    fn endpoint_url(&self, family: &str) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend([
                "api",
                family,
                self.server_id.as_str(),
                self.auth_token.expose_secret(),
            ]);
        Ok(url)
    }

    // ── Log path ─────────────────────────────────────────────────────

    /// POST one player-activity record to `/api/logs/...`.
    pub async fn post_log(&self, event: &LogEvent) -> Result<(), Error> {
        let url = self.endpoint_url("logs")?;
        debug!(server_id = %self.server_id, action = %event.action, "POST log event");

        let resp = self.http.post(url).json(event).send().await?;
        Self::ensure_success(resp).await.map(drop)
    }

    // ── Storage ──────────────────────────────────────────────────────

    /// Store `data` under `key`.
    pub async fn store(&self, key: &str, data: &Value) -> Result<(), Error> {
        self.storage(StorageAction::Store, key, Some(data))
            .await
            .map(drop)
    }

    /// Fetch the value stored under `key`. `Ok(None)` when the backend has none.
    pub async fn fetch(&self, key: &str) -> Result<Option<Value>, Error> {
        let body = match self.storage(StorageAction::Get, key, None).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if body.trim().is_empty() {
            return Ok(None);
        }

        let mut envelope: Value =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: body.clone(),
            })?;
        Ok(envelope
            .get_mut("data")
            .map(Value::take)
            .filter(|data| !data.is_null()))
    }

    /// Delete the value stored under `key`.
    pub async fn remove(&self, key: &str) -> Result<(), Error> {
        self.storage(StorageAction::Delete, key, None)
            .await
            .map(drop)
    }

    async fn storage(
        &self,
        action: StorageAction,
        key: &str,
        data: Option<&Value>,
    ) -> Result<String, Error> {
        let url = self.endpoint_url("storage")?;
        debug!(server_id = %self.server_id, ?action, key, "POST storage request");

        let resp = self
            .http
            .post(url)
            .json(&StorageRequest { action, key, data })
            .send()
            .await?;
        Self::ensure_success(resp).await
    }

    // ── Response handling ────────────────────────────────────────────

    /// Return the body of a 2xx response, or the status as an error.
    async fn ensure_success(resp: reqwest::Response) -> Result<String, Error> {
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_success() {
            return Ok(body);
        }
        if matches!(
            status,
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
        ) {
            return Err(Error::Authentication {
                status: status.as_u16(),
                message: "server id or auth token rejected".into(),
            });
        }
        Err(Error::Http {
            status: status.as_u16(),
            body,
        })
    }
}
