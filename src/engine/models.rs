//! # Container engine API payloads.
//!
//! Wire types exchanged with the container engine, shaped after the Docker
//! Engine API. Field names follow the engine's PascalCase convention via
//! serde renames; only the fields the reconciler actually reads are
//! modeled.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Result of inspecting one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerInspect {
    /// Engine-assigned container id.
    pub id: String,
    /// Engine-assigned name, usually with a leading `/`.
    pub name: String,
    /// Runtime state.
    pub state: ContainerState,
    /// Network configuration, including host port bindings.
    pub network_settings: NetworkSettings,
}

impl ContainerInspect {
    /// Container name without the engine's leading slash.
    pub fn plain_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }
}

/// Runtime state section of an inspect payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerState {
    /// True while the container process is alive.
    pub running: bool,
    /// Exit code of the last run, meaningful when not running.
    pub exit_code: i64,
}

/// Network section of an inspect payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkSettings {
    /// Map of `"<port>/<proto>"` to host bindings. The engine reports
    /// unbound exposed ports as `null`.
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

impl NetworkSettings {
    /// First host port bound for the given `"<port>/<proto>"` key.
    pub fn host_port(&self, key: &str) -> Option<&str> {
        self.ports
            .get(key)?
            .as_ref()?
            .first()?
            .host_port
            .as_deref()
    }
}

/// One host-side binding of a container port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortBinding {
    /// Host address, `0.0.0.0` when unspecified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Host port as a string, per the engine's convention.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<String>,
}

/// One entry of a container listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// All names attached to the container. Linked containers show up with
    /// alias names containing two slashes, e.g. `/web/db`.
    pub names: Vec<String>,
    /// Image reference the container was created from.
    pub image: String,
    /// Coarse state string (`running`, `exited`, ...).
    pub state: String,
}

impl ContainerSummary {
    /// First listed name without the engine's leading slash.
    pub fn first_name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or("")
    }
}

/// Result of inspecting one image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageInspect {
    /// Image id.
    pub id: String,
    /// Repository tags pointing at this image.
    pub repo_tags: Vec<String>,
}

/// One entry of an image listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageSummary {
    /// Image id.
    pub id: String,
    /// Repository tags pointing at this image. `null` for danglers.
    pub repo_tags: Vec<String>,
}

/// Create-time options for a new container.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerOptions {
    /// Canonical container name (sent as a query parameter, not in the
    /// body, but carried here so the contract stays in one place).
    #[serde(skip)]
    pub name: String,
    /// Image reference `image:tag`.
    pub image: String,
    /// Extra exposed ports, keyed `"<port>/<proto>"` with empty values.
    pub exposed_ports: BTreeMap<String, HashMap<(), ()>>,
    /// Environment as `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Command tokens.
    pub cmd: Vec<String>,
}

/// Start-time options for a created container.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartContainerOptions {
    /// Container-port to host bindings.
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    /// Publish all exposed ports to random host ports.
    pub publish_all_ports: bool,
    /// Links as `<containerName>:<alias>`.
    pub links: Vec<String>,
    /// Bind mounts as `<hostPath>:<containerPath>`.
    pub binds: Vec<String>,
}

/// Pull request parameters.
#[derive(Debug, Clone, Default)]
pub struct CreateImageOptions {
    /// Image repository to pull.
    pub from_image: String,
    /// Tag to pull.
    pub tag: String,
    /// Optional registry.
    pub registry: Option<String>,
}

/// One message from an image pull progress stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullProgress {
    /// Human-readable status line.
    #[serde(default)]
    pub status: Option<String>,
    /// Error text; a non-empty value fails the pull.
    #[serde(default)]
    pub error: Option<String>,
}
