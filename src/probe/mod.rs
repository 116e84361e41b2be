//! # Health probes.
//!
//! A [`HealthProbe`] runs a service's configured probe list against the
//! latest engine inspect payload and yields an aggregate healthy/unhealthy
//! answer.
//!
//! ## Rules
//! - An empty probe list is always healthy; the container counts as
//!   started the moment it is Running.
//! - An HTTP probe resolves its host port from
//!   `NetworkSettings.Ports[<port>][0].HostPort`; a missing binding fails
//!   the probe without raising an error.
//! - The GET accepts invalid TLS certificates; healthy iff status is 200.
//! - All probes must pass for the aggregate to be healthy.
//! - Unknown probe kinds are logged and treated as passing.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::{HttpProbe, ProbeSpec};
use crate::engine::ContainerInspect;

/// Per-request timeout for probe GETs.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// Aggregate health checker for one container.
pub struct HealthProbe {
    client: Client,
    probes: Vec<ProbeSpec>,
}

impl HealthProbe {
    /// Builds a checker for the given probe list.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    pub fn new(probes: Vec<ProbeSpec>) -> Self {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
            .expect("failed to create HTTP client");
        Self { client, probes }
    }

    /// True when the probe list is empty; such containers are healthy on
    /// start.
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Runs every probe against the inspect payload.
    pub async fn check(&self, inspect: &ContainerInspect) -> bool {
        for probe in &self.probes {
            match probe {
                ProbeSpec::Http { http } => {
                    if !self.check_http(http, inspect).await {
                        return false;
                    }
                }
                ProbeSpec::Other(raw) => {
                    debug!(probe = %raw, "unknown probe kind, treating as healthy");
                }
            }
        }
        true
    }

    async fn check_http(&self, probe: &HttpProbe, inspect: &ContainerInspect) -> bool {
        let key = probe.port_key();
        let Some(host_port) = inspect.network_settings.host_port(&key) else {
            debug!(port = %key, "no host binding for probe port");
            return false;
        };

        let url = format!(
            "{}://{}:{}{}",
            probe.protocol, probe.ip, host_port, probe.path
        );
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().as_u16() == 200,
            Err(e) => {
                debug!(url = %url, error = %e, "probe request failed");
                false
            }
        }
    }
}
