//! # Endpoint registration into a TTL key-value store.
//!
//! Every healthy watch tick re-publishes the container's host-visible
//! endpoints. Keys expire on their own: if the daemon or the container
//! dies, the registration ages out instead of lingering.
//!
//! ## Key format
//! ```text
//! <Prefix><serviceName>/<Ip>:<containerIndex>:<containerPort>
//! ```
//! where the slash in the engine's port key (`4001/tcp`) is replaced by an
//! underscore. The value is `<Ip>:<hostPort>`.
//!
//! ## Rules
//! - A missing `Registration.Ip` is fatal at construction.
//! - An individual write failure is logged and surfaced to the caller; it
//!   never tears down the container it belongs to.
//! - Concurrent writes are safe: keys are disjoint per
//!   service/index/port.

mod store;

pub use store::{HttpStore, TtlStore};

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::RegistrationConfig;
use crate::engine::ContainerInspect;
use crate::error::RegistryError;

/// Publishes container endpoints with a TTL.
pub struct Registry {
    store: Arc<dyn TtlStore>,
    prefix: String,
    ip: String,
    ttl: Duration,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("prefix", &self.prefix)
            .field("ip", &self.ip)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Builds a registry from manifest configuration.
    ///
    /// Fails with [`RegistryError::MissingIp`] when `Registration.Ip` is
    /// absent; callers are expected to treat that as fatal.
    pub fn from_config(
        cfg: &RegistrationConfig,
        store: Arc<dyn TtlStore>,
    ) -> Result<Self, RegistryError> {
        let ip = cfg.ip.clone().ok_or(RegistryError::MissingIp)?;
        Ok(Self {
            store,
            prefix: cfg.prefix.clone(),
            ip,
            ttl: Duration::from_secs(cfg.ttl),
        })
    }

    /// Writes one key per bound port of the inspected container.
    ///
    /// Returns the first error encountered after attempting every port;
    /// callers log and carry on.
    pub async fn publish(
        &self,
        service: &str,
        index: usize,
        inspect: &ContainerInspect,
    ) -> Result<(), RegistryError> {
        let mut first_err = None;
        for (port_key, bindings) in &inspect.network_settings.ports {
            let Some(bindings) = bindings else { continue };
            let Some(host_port) = bindings.first().and_then(|b| b.host_port.as_deref()) else {
                continue;
            };

            let key = self.endpoint_key(service, index, port_key);
            let value = format!("{}:{}", self.ip, host_port);
            if let Err(e) = self.store.put(&key, &value, self.ttl).await {
                warn!(key = %key, error = %e, label = e.as_label(), "registry write failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Formats the registration key for one container port.
    pub fn endpoint_key(&self, service: &str, index: usize, port_key: &str) -> String {
        let port = port_key.replace('/', "_");
        format!("{}{}/{}:{}:{}", self.prefix, service, self.ip, index, port)
    }
}
