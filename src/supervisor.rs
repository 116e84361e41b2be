//! # Supervisor: sequences config changes into application swaps.
//!
//! The supervisor owns a single serialized lane for config-change tasks.
//! Change notifications land in a [`tokio::sync::watch`] channel, so a
//! burst of notifications collapses to the newest one; whatever task is
//! already applying runs to completion (there is no preemption), then the
//! latest pending change is applied.
//!
//! ## Change flow
//! ```text
//! notify_change()
//!   └─► watch channel (collapse-on-newer)
//!         └─► apply: load manifest
//!                    build new Application
//!                    mark previous Application stopping
//!                    launch new Application
//!                    swap on success
//! ```
//!
//! ## Rules
//! - A failed change is logged and dropped; the previous application stays
//!   active (though already marked stopping once the launch got that far).
//! - The daemon never exits on a reconciliation failure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::Application;
use crate::config::Manifest;
use crate::engine::EngineClient;
use crate::error::RuntimeError;
use crate::registry::TtlStore;

/// Coarse daemon state, mirroring what a status endpoint would report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No application has been launched yet.
    Empty,
    /// A config change is being applied.
    Updating,
    /// An application is active and no change is in flight.
    Idle,
}

impl SupervisorState {
    /// Stable lowercase label for logs and status payloads.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorState::Empty => "empty",
            SupervisorState::Updating => "updating",
            SupervisorState::Idle => "idle",
        }
    }
}

/// Receives config-change notifications and swaps applications.
pub struct Supervisor {
    engine: Arc<EngineClient>,
    store: Arc<dyn TtlStore>,
    config_path: PathBuf,
    active: RwLock<Option<Arc<Application>>>,
    updating: AtomicBool,
    changes: watch::Sender<u64>,
}

impl Supervisor {
    /// Creates a supervisor for the manifest at `config_path`.
    pub fn new(
        config_path: PathBuf,
        engine: Arc<EngineClient>,
        store: Arc<dyn TtlStore>,
    ) -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            engine,
            store,
            config_path,
            active: RwLock::new(None),
            updating: AtomicBool::new(false),
            changes,
        })
    }

    /// Enqueues a config-change task, replacing any still-pending one.
    pub fn notify_change(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    /// Drives config changes until `token` is cancelled.
    ///
    /// The manifest present at startup counts as the first change.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut rx = self.changes.subscribe();
        rx.mark_changed();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_change().await;
                }
            }
        }
    }

    /// The currently active application, if any.
    pub async fn active(&self) -> Option<Arc<Application>> {
        self.active.read().await.clone()
    }

    /// True when every enabled service of the active application is fully
    /// up.
    pub async fn is_up(&self) -> bool {
        match self.active().await {
            Some(app) => app.is_up().await,
            None => false,
        }
    }

    /// Coarse daemon state.
    pub async fn state(&self) -> SupervisorState {
        if self.updating.load(Ordering::Acquire) {
            SupervisorState::Updating
        } else if self.active.read().await.is_some() {
            SupervisorState::Idle
        } else {
            SupervisorState::Empty
        }
    }

    /// Stops every service of the active application.
    pub async fn stop_all(&self) {
        if let Some(app) = self.active().await {
            app.stop_all().await;
        }
    }

    async fn apply_change(&self) {
        self.updating.store(true, Ordering::Release);
        if let Err(e) = self.try_apply().await {
            error!(error = %e, label = e.as_label(), "config change failed, keeping previous application");
        }
        self.updating.store(false, Ordering::Release);
    }

    async fn try_apply(&self) -> Result<(), RuntimeError> {
        info!(path = %self.config_path.display(), "applying configuration");
        let manifest = Manifest::load(&self.config_path)?;
        let app = Application::build(&manifest, Arc::clone(&self.engine), Arc::clone(&self.store))?;

        let previous = self.active.read().await.clone();
        app.launch(previous.as_ref()).await?;

        *self.active.write().await = Some(app);
        info!("configuration applied");
        Ok(())
    }
}
