//! # kiruna
//!
//! **Kiruna** is a single-host container orchestration daemon and watchdog.
//! It reads a declarative service manifest, reconciles the host's running
//! containers toward that desired state, health-watches every container,
//! restarts or replaces containers when they fail or the manifest changes,
//! publishes host-visible endpoints into a TTL key-value registry, and
//! cleans up obsolete containers and images.
//!
//! ## Components
//!
//! | Area               | Description                                                        | Key types                                |
//! |--------------------|--------------------------------------------------------------------|------------------------------------------|
//! | **Manifest**       | JSON config with variable expansion and defaults merging.          | [`Manifest`], [`ServiceSpec`]             |
//! | **Engine access**  | Serialized facade over an opaque container engine.                 | [`Engine`], [`EngineClient`], [`HttpEngine`] |
//! | **Registration**   | TTL-based publication of container endpoints.                      | [`Registry`], [`TtlStore`], [`HttpStore`] |
//! | **Health**         | HTTP probes over engine inspect payloads.                          | [`HealthProbe`]                           |
//! | **Watch loops**    | One runner per live container, with a failure budget.              | [`ContainerRunner`]                       |
//! | **Rollouts**       | Per-service state machine on a serialized work queue.              | [`Service`], [`WorkQueue`]                |
//! | **Reconciliation** | Dependency-ordered launch pipeline and global janitor.             | [`Application`]                           |
//! | **Supervision**    | Collapse-on-newer config-change sequencing.                        | [`Supervisor`]                            |
//! | **Errors**         | Typed errors per failure domain.                                   | [`ConfigError`], [`EngineError`], [`RuntimeError`] |
//!
//! ## Data flow
//! ```text
//! config change ──► Supervisor ──► Application::launch
//!                                       ├──► pull images (dependency order)
//!                                       └──► per-service rollout
//!                                              ├──► adopt / create / start
//!                                              └──► ContainerRunner watch loop
//!                                                     ├──► healthy → register endpoints
//!                                                     └──► events → Service aggregation
//!                                                             └──► dependents react,
//!                                                                  janitor reaps old state
//! ```

mod app;
mod config;
mod engine;
mod error;
mod events;
mod probe;
mod registry;
mod runner;
mod service;
mod supervisor;

// ---- Public re-exports ----

pub use app::{sort_by_dependency, validate_manifest, Application, IMAGES_TO_KEEP};
pub use config::{
    split_host_port, ConsoleLogging, HostBinding, HostPortSpec, HttpProbe, LogglyConfig,
    LoggingConfig, Manifest, ProbeSpec, RegistrationConfig, ServiceSpec,
};
pub use engine::{
    ContainerInspect, ContainerState, ContainerSummary, CreateContainerOptions,
    CreateImageOptions, Engine, EngineClient, HttpEngine, ImageInspect, ImageSummary,
    NetworkSettings, PortBinding, ProgressStream, PullProgress, StartContainerOptions,
};
pub use error::{ConfigError, EngineError, RegistryError, RuntimeError};
pub use events::{Bus, Event, EventKind};
pub use probe::HealthProbe;
pub use registry::{HttpStore, Registry, TtlStore};
pub use runner::{ContainerRunner, RunnerContext, FAST_WATCH, MAX_HEALTH_FAILURES, STEADY_WATCH};
pub use service::naming::{self, POSTFIX};
pub use service::{Service, WorkQueue, MAX_FAILURES};
pub use supervisor::{Supervisor, SupervisorState};
