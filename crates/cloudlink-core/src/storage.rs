//! Key/value storage on the backend's HTTP API.
//!
//! Same contract as the link's sends: failures are logged and come back
//! as `false` / `None`, never as errors.

use serde_json::Value;
use tracing::{debug, warn};

use cloudlink_api::BackendClient;

use crate::config::StreamEndpoint;
use crate::error::LinkError;

/// Per-server storage facade.
#[derive(Debug, Clone)]
pub struct CloudStorage {
    client: BackendClient,
}

impl CloudStorage {
    /// Storage for `server_id` on the backend behind `endpoint`.
    pub fn new(server_id: &str, endpoint: &StreamEndpoint) -> Result<Self, LinkError> {
        let client = BackendClient::new(
            endpoint.base_url.clone(),
            server_id,
            endpoint.auth_token.clone(),
            &endpoint.tls.to_transport(endpoint.request_timeout),
        )?;
        Ok(Self { client })
    }

    pub fn from_client(client: BackendClient) -> Self {
        Self { client }
    }

    pub async fn store(&self, key: &str, value: &Value) -> bool {
        match self.client.store(key, value).await {
            Ok(()) => {
                debug!(key, "stored");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "storage write failed");
                false
            }
        }
    }

    /// `None` when the key is absent or the backend could not be reached.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.client.fetch(key).await.unwrap_or_else(|e| {
            warn!(key, error = %e, "storage read failed");
            None
        })
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.client.remove(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "storage delete failed");
                false
            }
        }
    }
}
