//! # Error types used by the kiruna runtime.
//!
//! This module defines one error enum per failure domain:
//!
//! - [`ConfigError`] manifest loading, variable expansion, and validation.
//! - [`EngineError`] calls into the container engine.
//! - [`RegistryError`] endpoint publication into the TTL key-value store.
//! - [`RuntimeError`] umbrella for the supervisor and application layers.
//!
//! All types provide `as_label` helpers returning short stable snake_case
//! labels for logs and metrics. [`EngineError::is_gone`] classifies the
//! "no such container/image" family, which most callers treat as success
//! during teardown.

use thiserror::Error;

/// # Errors raised while loading or validating the service manifest.
///
/// A config error aborts the current config-change task only; the previously
/// active application keeps running.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Manifest file could not be read.
    #[error("cannot read manifest '{path}': {source}")]
    Io {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Manifest is not well-formed JSON.
    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A `${ key }` reference has no value in `Variables` or the process
    /// environment.
    #[error("undefined variable '{name}'")]
    MissingVariable {
        /// The unresolved variable name.
        name: String,
    },

    /// Variable values reference each other in a cycle.
    #[error("circular variable reference through '{name}'")]
    CircularVariable {
        /// The variable at which the cycle was detected.
        name: String,
    },

    /// A required service field is empty or missing.
    #[error("service '{service}': missing required field '{field}'")]
    MissingField {
        /// Offending service name.
        service: String,
        /// Name of the missing field.
        field: String,
    },

    /// `Scale` must be at least 1.
    #[error("service '{service}': Scale must be >= 1")]
    InvalidScale {
        /// Offending service name.
        service: String,
    },

    /// A dependency names a service that does not exist in the manifest.
    #[error("service '{service}': unknown dependency '{dependency}'")]
    UnknownDependency {
        /// Offending service name.
        service: String,
        /// The unresolved dependency name.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving services: {services:?}")]
    DependencyCycle {
        /// Services still unplaced when the sort gave up.
        services: Vec<String>,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "config_io",
            ConfigError::Parse(_) => "config_parse",
            ConfigError::MissingVariable { .. } => "config_missing_variable",
            ConfigError::CircularVariable { .. } => "config_circular_variable",
            ConfigError::MissingField { .. } => "config_missing_field",
            ConfigError::InvalidScale { .. } => "config_invalid_scale",
            ConfigError::UnknownDependency { .. } => "config_unknown_dependency",
            ConfigError::DependencyCycle { .. } => "config_dependency_cycle",
        }
    }
}

/// # Errors raised by the container engine facade.
///
/// The gone family (`NoSuchContainer`, `NoSuchImage`) is normalized out of
/// HTTP 404 responses and is routinely treated as success during stop and
/// remove. Everything else is transient from the watchdog's point of view:
/// there is no in-call retry, the next watch tick tries again.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine has no container with the given id or name.
    #[error("no such container: {name}")]
    NoSuchContainer {
        /// Id or name that was looked up.
        name: String,
    },

    /// The engine has no image with the given reference.
    #[error("no such image: {reference}")]
    NoSuchImage {
        /// Image reference that was looked up.
        reference: String,
    },

    /// The engine answered with a non-success status.
    #[error("engine api error (status {status}): {message}")]
    Api {
        /// HTTP-equivalent status code.
        status: u16,
        /// Response body or status text.
        message: String,
    },

    /// The engine could not be reached.
    #[error("engine transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// An engine payload could not be decoded.
    #[error("engine payload decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// An image pull did not run to completion.
    #[error("pull of '{reference}' failed: {reason}")]
    PullFailed {
        /// Image reference being pulled.
        reference: String,
        /// Error reported by the progress stream.
        reason: String,
    },
}

impl EngineError {
    /// True for the "not found" family that teardown paths treat as success.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            EngineError::NoSuchContainer { .. } | EngineError::NoSuchImage { .. }
        )
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::NoSuchContainer { .. } => "engine_no_such_container",
            EngineError::NoSuchImage { .. } => "engine_no_such_image",
            EngineError::Api { .. } => "engine_api",
            EngineError::Transport(_) => "engine_transport",
            EngineError::Decode(_) => "engine_decode",
            EngineError::PullFailed { .. } => "engine_pull_failed",
        }
    }
}

/// # Errors raised by endpoint registration.
///
/// A missing host IP is fatal at construction time. Individual write
/// failures are logged and surfaced to the caller but never stop the
/// container they belong to.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RegistryError {
    /// `Registration.Ip` is absent from the manifest.
    #[error("Registration.Ip is not configured")]
    MissingIp,

    /// A TTL put against the backing store failed.
    #[error("registry write for '{key}' failed: {reason}")]
    Store {
        /// Key that was being written.
        key: String,
        /// Error reported by the store.
        reason: String,
    },
}

impl RegistryError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            RegistryError::MissingIp => "registry_missing_ip",
            RegistryError::Store { .. } => "registry_store",
        }
    }
}

/// # Umbrella error for the supervisor and application layers.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Manifest could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A container engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Registration misconfiguration or write failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RuntimeError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Config(e) => e.as_label(),
            RuntimeError::Engine(e) => e.as_label(),
            RuntimeError::Registry(e) => e.as_label(),
        }
    }
}
