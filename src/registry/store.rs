//! # TTL key-value store contract and HTTP implementation.
//!
//! The registration store is external; the daemon only needs one verb: a
//! put that expires. [`HttpStore`] speaks the etcd v2 keys API
//! (`PUT /v2/keys/<key>` with `value` and `ttl` form fields), which is what
//! the daemon's deployments historically registered into. Tests substitute
//! an in-memory double.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::RegistryError;

/// One-verb contract for the registration store.
#[async_trait]
pub trait TtlStore: Send + Sync + 'static {
    /// Writes `key = value` with the given time-to-live.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RegistryError>;
}

/// etcd v2 keys API client.
pub struct HttpStore {
    client: Client,
    base: String,
}

impl HttpStore {
    /// Creates a store client for the given base URL.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    pub fn new(base: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("kiruna/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TtlStore for HttpStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RegistryError> {
        let url = format!("{}/v2/keys/{}", self.base, key);
        let form = [
            ("value", value.to_string()),
            ("ttl", ttl.as_secs().to_string()),
        ];
        let resp = self
            .client
            .put(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RegistryError::Store {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RegistryError::Store {
            key: key.to_string(),
            reason: format!("status {status}: {body}"),
        })
    }
}
