//! # Manifest model: the declarative description of the host's services.
//!
//! The manifest is a UTF-8 JSON file with the top-level keys `Variables`,
//! `Defaults`, `Services`, `Registration`, and `Logging`. Loading runs in
//! three stages:
//!
//! 1. parse the raw JSON tree,
//! 2. expand `${ key }` variable references in place (see
//!    [`expand_tree`](crate::config::expand_tree)),
//! 3. merge `Defaults` under each service entry and decode the result into
//!    a validated [`ServiceSpec`].
//!
//! ## Rules
//! - A service entry wins over `Defaults` on key conflicts (shallow merge).
//! - `Image` and `Tag` must be non-empty; `Scale` must be at least 1.
//! - Every dependency must name another service in the manifest.
//! - `Services` is a sorted map, so sibling services without
//!   interdependencies keep a stable relative order across loads.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::expand::expand_tree;
use crate::error::ConfigError;

/// Parsed manifest file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Manifest {
    /// Substitution table for `${ key }` references.
    pub variables: BTreeMap<String, String>,
    /// Overrides merged under every service entry.
    pub defaults: Option<Value>,
    /// Raw service entries, keyed by service name.
    pub services: BTreeMap<String, Value>,
    /// Endpoint registration settings.
    pub registration: RegistrationConfig,
    /// Log sink settings.
    pub logging: LoggingConfig,
}

impl Manifest {
    /// Reads and expands the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parses a manifest from raw JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut root: Value = serde_json::from_str(text)?;
        let vars: BTreeMap<String, String> = match root.get("Variables") {
            Some(v) => serde_json::from_value(v.clone())?,
            None => BTreeMap::new(),
        };
        expand_tree(&mut root, &vars)?;
        Ok(serde_json::from_value(root)?)
    }

    /// Decodes and validates every service entry, with `Defaults` merged in.
    ///
    /// Entries come back sorted by service name; the topological sort later
    /// refines this order without reshuffling independent siblings.
    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>, ConfigError> {
        let mut specs = Vec::with_capacity(self.services.len());
        for (name, entry) in &self.services {
            let merged = merge_defaults(entry, self.defaults.as_ref());
            let mut spec: ServiceSpec = serde_json::from_value(merged)?;
            spec.name = name.clone();
            self.validate(&spec)?;
            specs.push(spec);
        }
        Ok(specs)
    }

    fn validate(&self, spec: &ServiceSpec) -> Result<(), ConfigError> {
        if spec.image.is_empty() {
            return Err(ConfigError::MissingField {
                service: spec.name.clone(),
                field: "Image".into(),
            });
        }
        if spec.tag.is_empty() {
            return Err(ConfigError::MissingField {
                service: spec.name.clone(),
                field: "Tag".into(),
            });
        }
        if spec.scale == 0 {
            return Err(ConfigError::InvalidScale {
                service: spec.name.clone(),
            });
        }
        for dep in &spec.dependencies {
            let (dep_name, _) = split_dependency(dep);
            if !self.services.contains_key(dep_name) {
                return Err(ConfigError::UnknownDependency {
                    service: spec.name.clone(),
                    dependency: dep_name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Shallow merge: start from `Defaults`, then let the service entry's own
/// keys win.
fn merge_defaults(entry: &Value, defaults: Option<&Value>) -> Value {
    match (entry, defaults) {
        (Value::Object(entry_map), Some(Value::Object(default_map))) => {
            let mut merged = default_map.clone();
            for (k, v) in entry_map {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => entry.clone(),
    }
}

/// Splits a dependency entry `name[:alias]` into `(name, alias)`.
///
/// The alias defaults to the dependency's service name.
pub fn split_dependency(dep: &str) -> (&str, &str) {
    match dep.split_once(':') {
        Some((name, alias)) if !alias.is_empty() => (name, alias),
        _ => (dep, dep),
    }
}

/// Immutable description of one desired service.
///
/// The serialized form of this struct (plus the daemon version) is what the
/// generation hash in container names is computed over, so field order and
/// collection types here are deliberately deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceSpec {
    /// Service name; filled from the `Services` map key.
    pub name: String,
    /// Image repository, without tag.
    pub image: String,
    /// Image tag.
    pub tag: String,
    /// Optional registry to pull from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Number of identical replicas, `>= 1`.
    pub scale: usize,
    /// Disabled services are skipped by the launch pipeline.
    pub enabled: bool,
    /// Stop the previous generation before creating the next one.
    pub hard_deploy: bool,
    /// Ordered dependency entries `name[:alias]`.
    pub dependencies: Vec<String>,
    /// Container-port to host-port bindings.
    pub ports: BTreeMap<String, HostPortSpec>,
    /// Publish every exposed port to a random host port.
    pub publish_all_ports: bool,
    /// Extra exposed container ports.
    #[serde(deserialize_with = "port_set")]
    pub expose: BTreeSet<String>,
    /// Environment variables for the container.
    pub environment: BTreeMap<String, String>,
    /// Container-path to host-path bind mounts.
    pub volumes: BTreeMap<String, String>,
    /// Command tokens overriding the image default.
    pub cmd: Vec<String>,
    /// Health probes run on each watch tick.
    pub health: Vec<ProbeSpec>,
    /// Delay between "all replicas healthy" and retiring the previous
    /// generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_timeout_ms: Option<u64>,
    /// Publish endpoints into the registration store.
    pub register: bool,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: String::new(),
            tag: String::new(),
            registry: None,
            scale: 1,
            enabled: true,
            hard_deploy: false,
            dependencies: Vec::new(),
            ports: BTreeMap::new(),
            publish_all_ports: false,
            expose: BTreeSet::new(),
            environment: BTreeMap::new(),
            volumes: BTreeMap::new(),
            cmd: Vec::new(),
            health: Vec::new(),
            settle_timeout_ms: None,
            register: true,
        }
    }
}

impl ServiceSpec {
    /// Full image reference `image:tag`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Dependency entries as `(name, alias)` pairs.
    pub fn dependency_pairs(&self) -> Vec<(&str, &str)> {
        self.dependencies
            .iter()
            .map(|d| split_dependency(d))
            .collect()
    }

    /// Direct dependency names, aliases stripped.
    pub fn dependency_names(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .map(|d| split_dependency(d).0)
            .collect()
    }
}

/// Host side of a port mapping: a bare port or an `ip:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostPortSpec {
    /// Numeric form, e.g. `4001`.
    Port(u64),
    /// String form, either `"4001"` or `"10.0.0.1:4001"`.
    Spec(String),
}

/// Split host binding produced from a [`HostPortSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    /// Bind address; `None` for the numeric spec form.
    pub host_ip: Option<String>,
    /// Host port.
    pub host_port: String,
}

/// Splits a host-port spec into its binding parts.
///
/// - `"1.2.3.4:80"` → ip `1.2.3.4`, port `80` (split on the first `:`)
/// - `"80"` → ip `0.0.0.0`, port `80`
/// - `80` → port `80`, no ip
pub fn split_host_port(spec: &HostPortSpec) -> HostBinding {
    match spec {
        HostPortSpec::Port(n) => HostBinding {
            host_ip: None,
            host_port: n.to_string(),
        },
        HostPortSpec::Spec(s) => match s.split_once(':') {
            Some((ip, port)) => HostBinding {
                host_ip: Some(ip.to_string()),
                host_port: port.to_string(),
            },
            None => HostBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: s.clone(),
            },
        },
    }
}

/// One health probe from the manifest's `Health` list.
///
/// Probe kinds other than `Http` are accepted, logged at check time, and
/// treated as passing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeSpec {
    /// HTTP GET probe.
    Http {
        /// Probe parameters.
        #[serde(rename = "Http")]
        http: HttpProbe,
    },
    /// Unknown probe kind, kept verbatim.
    Other(Value),
}

/// Parameters of an HTTP health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HttpProbe {
    /// Container port whose host binding is probed. A bare port assumes
    /// `tcp`.
    pub port: HostPortSpec,
    /// Address the probe connects to.
    pub ip: String,
    /// Request path.
    pub path: String,
    /// `http` or `https`.
    pub protocol: String,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self {
            port: HostPortSpec::Port(0),
            ip: "127.0.0.1".to_string(),
            path: "/".to_string(),
            protocol: "http".to_string(),
        }
    }
}

impl HttpProbe {
    /// Key used to look this probe's port up in the engine's
    /// `NetworkSettings.Ports` map (`"4001/tcp"` form).
    pub fn port_key(&self) -> String {
        let raw = match &self.port {
            HostPortSpec::Port(n) => n.to_string(),
            HostPortSpec::Spec(s) => s.clone(),
        };
        if raw.contains('/') {
            raw
        } else {
            format!("{raw}/tcp")
        }
    }
}

/// Endpoint registration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegistrationConfig {
    /// Base URL of the TTL key-value store.
    pub url: Option<String>,
    /// Prefix prepended to every key.
    pub prefix: String,
    /// Host IP advertised in keys and values. Required when any service
    /// registers.
    pub ip: Option<String>,
    /// Time-to-live for each write, in seconds.
    pub ttl: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            url: None,
            prefix: String::new(),
            ip: None,
            ttl: 60,
        }
    }
}

/// Log sink settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoggingConfig {
    /// Console sink.
    pub console: ConsoleLogging,
    /// Optional Loggly shipping config; parsed for compatibility, the sink
    /// itself is an external collaborator.
    pub loggly: Option<LogglyConfig>,
}

/// Console log sink settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConsoleLogging {
    /// Minimum level, e.g. `debug`, `info`, `warn`.
    pub level: String,
}

impl Default for ConsoleLogging {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Loggly shipping settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogglyConfig {
    /// Minimum level to ship.
    pub level: String,
    /// Loggly subdomain.
    pub sub_domain: String,
    /// Customer token.
    pub token: String,
    /// Tags attached to shipped entries.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Accepts both numbers and strings for exposed port lists.
fn port_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Value> = Vec::deserialize(deserializer)?;
    let mut out = BTreeSet::new();
    for item in raw {
        match item {
            Value::String(s) => {
                out.insert(s);
            }
            Value::Number(n) => {
                out.insert(n.to_string());
            }
            other => {
                return Err(serde::de::Error::custom(format!(
                    "invalid Expose entry: {other}"
                )))
            }
        }
    }
    Ok(out)
}
