//! # Lifecycle events emitted by runners and services.
//!
//! The [`EventKind`] enum classifies event types across two levels:
//! - **Container events**: emitted by a single watch loop (started, stopped)
//! - **Service events**: aggregated per service (started, all started, stopped)
//!
//! The [`Event`] struct carries metadata such as the owning service, the
//! replica index, the engine container id, and error text.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically, so consumers can order events correctly even when they
//! arrive through async channels.
//!
//! ## Event flow
//! ```text
//! watch loop: first healthy probe      → ContainerStarted  (at most once)
//! watch loop: gone / dead / budget out → ContainerStopped  (at most once)
//!
//! service aggregation:
//!   running count 0 → 1                → ServiceStarted
//!   running count reaches Scale        → ServiceAllStarted
//!   last running replica lost          → ServiceStopped
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Container lifecycle ===
    /// A container passed its first health check.
    ContainerStarted,
    /// A container is terminally gone (engine removed it, it left the
    /// Running state, or it exhausted its health-failure budget).
    ContainerStopped,

    // === Service aggregation ===
    /// The first replica of a service is running.
    ServiceStarted,
    /// Every scaled replica of a service is running.
    ServiceAllStarted,
    /// No replica of a service is running anymore.
    ServiceStopped,
}

/// Lifecycle event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Name of the service this event belongs to.
    pub service: Option<String>,
    /// Replica index within the service, for container events.
    pub index: Option<usize>,
    /// Engine container id, for container events.
    pub container: Option<String>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
}

impl Event {
    /// Creates a new event of the given kind with the next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            service: None,
            index: None,
            container: None,
            error: None,
        }
    }

    /// Attaches the owning service name.
    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.service = Some(name.into());
        self
    }

    /// Attaches a replica index.
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// Attaches an engine container id.
    pub fn with_container(mut self, id: impl Into<String>) -> Self {
        self.container = Some(id.into());
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }
}
