//! # Application: one snapshot of the manifest, reconciled as a whole.
//!
//! An [`Application`] owns the dependency-ordered service graph, the event
//! bus that wires services together, and the global janitor that reaps
//! obsolete containers and prunes old image tags.
//!
//! ## Architecture
//! ```text
//! Manifest ──► Application::build()
//!                   ├──► merge Defaults, validate, topo-sort specs
//!                   ├──► one Service per spec (linked transitively)
//!                   └──► routing listener on the Bus
//!                           ├──► ContainerStarted/Stopped → owning Service
//!                           ├──► ServiceStarted/Stopped   → dependents
//!                           └──► ServiceAllStarted        → janitor pass
//!
//! launch(previous)
//!   ├──► pull images, in dependency order (sequential)
//!   ├──► mark previous application stopping
//!   └──► launch services, in dependency order
//! ```
//!
//! ## Rules
//! - A failing service never prevents its siblings from launching; only
//!   pull failures abort the config-change task.
//! - The janitor only ever touches containers whose name carries the
//!   ownership postfix.
//! - The image in use by a service is never pruned.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Manifest;
use crate::config::ServiceSpec;
use crate::engine::{EngineClient, ImageSummary};
use crate::error::{ConfigError, EngineError, RegistryError, RuntimeError};
use crate::events::{Bus, Event, EventKind};
use crate::registry::{Registry, TtlStore};
use crate::service::{naming, Service};

/// Tagged images retained per service after cleanup: the one in use plus
/// `IMAGES_TO_KEEP - 1` older generations.
pub const IMAGES_TO_KEEP: usize = 3;

/// Event bus capacity; sized for burst rollouts of large manifests.
const BUS_CAPACITY: usize = 1024;

/// Runtime object for one accepted manifest.
pub struct Application {
    services: Vec<Arc<Service>>,
    bus: Bus,
    engine: Arc<EngineClient>,
    token: CancellationToken,
    stopping: AtomicBool,
}

impl Application {
    /// Builds the service graph from a manifest.
    ///
    /// Fails on validation errors (missing image/tag, unknown dependency,
    /// dependency cycle) and on registration misconfiguration. Must run
    /// inside a tokio runtime; building spawns the per-service queue
    /// workers and the routing listener.
    pub fn build(
        manifest: &Manifest,
        engine: Arc<EngineClient>,
        store: Arc<dyn TtlStore>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let specs = sort_by_dependency(manifest.service_specs()?)?;
        let registry = Arc::new(Registry::from_config(&manifest.registration, store)?);
        let bus = Bus::new(BUS_CAPACITY);
        let token = CancellationToken::new();

        let app = Arc::new_cyclic(|weak: &Weak<Application>| {
            let services = specs
                .into_iter()
                .map(|spec| {
                    Service::new(
                        spec,
                        Arc::clone(&engine),
                        Arc::clone(&registry),
                        bus.clone(),
                        Weak::clone(weak),
                        &token,
                    )
                })
                .collect();
            Application {
                services,
                bus: bus.clone(),
                engine,
                token,
                stopping: AtomicBool::new(false),
            }
        });

        // Sorted order guarantees each dependency's closure is complete
        // before its dependents link against it.
        for service in &app.services {
            service.link_dependencies(&app.services);
        }
        app.spawn_listener();
        Ok(app)
    }

    /// Services in dependency order.
    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    /// Looks a service up by name.
    pub fn service(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.iter().find(|s| s.name() == name)
    }

    /// True once [`Application::mark_stopping`] ran.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Pulls images and launches every enabled service, in dependency
    /// order.
    ///
    /// `previous` is the application being superseded; it is marked
    /// stopping after the pulls succeed, so its watchdogs stop restarting
    /// crashed containers while this generation takes over.
    pub async fn launch(
        self: &Arc<Self>,
        previous: Option<&Arc<Application>>,
    ) -> Result<(), RuntimeError> {
        // Sequential pulls; parallel pulls hammer the image registry and
        // gain little on a single host.
        for service in &self.services {
            if service.is_enabled() {
                service.pull_image().await?;
            }
        }

        if let Some(previous) = previous {
            previous.mark_stopping();
        }

        for service in &self.services {
            if service.is_enabled() {
                service.launch().await;
            }
        }
        Ok(())
    }

    /// Marks this application superseded: watch loops skip their remaining
    /// ticks and services refuse further restarts. In-flight engine calls
    /// complete.
    pub fn mark_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
        self.token.cancel();
    }

    /// Stops every service, dependents before their dependencies.
    pub async fn stop_all(&self) {
        for service in self.services.iter().rev() {
            service.stop().await;
        }
    }

    /// Stops every service that (transitively) depends on `name`, in
    /// reverse launch order.
    pub(crate) async fn stop_dependents(&self, name: &str) {
        for service in self.services.iter().rev() {
            if service.name() != name && service.depends_on(name) {
                service.stop().await;
            }
        }
    }

    /// True iff there is at least one service and every service is either
    /// disabled or has all its scaled replicas running.
    pub async fn is_up(&self) -> bool {
        if self.services.is_empty() {
            return false;
        }
        for service in &self.services {
            if !service.is_enabled() {
                continue;
            }
            if service.running_count().await < service.spec().scale {
                return false;
            }
        }
        true
    }

    /// Stops (if running) and removes a container, tolerating a container
    /// that is already gone at every step.
    pub async fn stop_and_remove_container(&self, id: &str) -> Result<(), EngineError> {
        match self.engine.inspect_container(id).await {
            Ok(inspect) if inspect.state.running => {
                match self.engine.stop_container(id).await {
                    Ok(()) => {}
                    Err(e) if e.is_gone() => {
                        debug!(container = %id, "container vanished during stop");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(_) => {}
            Err(e) if e.is_gone() => {
                debug!(container = %id, "container already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match self.engine.inspect_container(id).await {
            Ok(_) => {}
            Err(e) if e.is_gone() => return Ok(()),
            Err(e) => return Err(e),
        }
        match self.engine.remove_container(id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_gone() => {
                debug!(container = %id, "container vanished during remove");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ---- event routing ----

    /// Routes bus events to the services they concern. Runs until the
    /// application is marked stopping.
    fn spawn_listener(self: &Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let weak = Arc::downgrade(self);
        let token = self.token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => {
                            let Some(app) = weak.upgrade() else { break };
                            app.route(ev);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "event listener lagged");
                            continue;
                        }
                    }
                }
            }
        });
    }

    fn route(self: Arc<Self>, ev: Event) {
        match ev.kind {
            EventKind::ContainerStarted => {
                if let (Some(service), Some(id)) = (ev.service.as_deref(), ev.container) {
                    if let Some(s) = self.service(service) {
                        s.notify_container_started(id);
                    }
                }
            }
            EventKind::ContainerStopped => {
                if let (Some(service), Some(id)) = (ev.service.as_deref(), ev.container) {
                    if let Some(s) = self.service(service) {
                        s.notify_container_stopped(id);
                    }
                }
            }
            EventKind::ServiceStarted => {
                if let Some(dep) = ev.service {
                    for s in &self.services {
                        if s.name() != dep && s.depends_on(&dep) {
                            s.notify_dependency_started(dep.clone());
                        }
                    }
                }
            }
            EventKind::ServiceStopped => {
                if let Some(dep) = ev.service {
                    for s in &self.services {
                        if s.name() != dep && s.depends_on(&dep) {
                            s.notify_dependency_stopped(dep.clone());
                        }
                    }
                }
            }
            EventKind::ServiceAllStarted => {
                let app = Arc::clone(&self);
                tokio::spawn(async move { app.cleanup().await });
            }
        }
    }

    // ---- janitor ----

    /// Reaps obsolete containers and prunes old image tags once every
    /// enabled service is fully up.
    async fn cleanup(self: Arc<Self>) {
        if self.is_stopping() || !self.is_up().await {
            return;
        }
        self.cleanup_containers().await;
        self.cleanup_images().await;
    }

    /// Removes every owned container that is not among the services'
    /// current containers. Containers without the ownership postfix are
    /// never touched.
    async fn cleanup_containers(&self) {
        let listing = match self.engine.list_containers(true).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "container listing failed during cleanup");
                return;
            }
        };

        let mut valid: HashSet<String> = HashSet::new();
        for service in &self.services {
            valid.extend(service.current_container_ids().await);
        }

        for container in &listing {
            let name = container.first_name();
            if !naming::is_owned(name) || valid.contains(&container.id) {
                continue;
            }
            info!(container = %name, "removing obsolete container");
            if let Err(e) = self.stop_and_remove_container(&container.id).await {
                warn!(container = %name, error = %e, "obsolete container removal failed");
            }
        }
    }

    /// Prunes old tags per service image, keeping the tag in use plus the
    /// `IMAGES_TO_KEEP - 1` newest older ones. The daemon's own image gets
    /// the same treatment.
    async fn cleanup_images(&self) {
        let images = match self.engine.list_images().await {
            Ok(images) => images,
            Err(e) => {
                warn!(error = %e, "image listing failed during cleanup");
                return;
            }
        };

        for service in &self.services {
            let current = service.spec().image_ref();
            self.prune_image_group(&images, &service.spec().image, &current)
                .await;
        }
        // The daemon ships as an image too; prune our own old versions.
        let self_image = env!("CARGO_PKG_NAME");
        let self_current = format!("{self_image}:{}", naming::VERSION);
        self.prune_image_group(&images, self_image, &self_current)
            .await;
    }

    async fn prune_image_group(&self, images: &[ImageSummary], image: &str, current: &str) {
        let prefix = format!("{image}:");
        let tags: Vec<String> = images
            .iter()
            .flat_map(|img| img.repo_tags.iter())
            .filter(|tag| tag.starts_with(&prefix) && tag.as_str() != current)
            .cloned()
            .collect();

        for tag in select_images_to_remove(tags, IMAGES_TO_KEEP - 1) {
            info!(image = %tag, "removing old image");
            if let Err(e) = self.engine.remove_image(&tag).await {
                if !e.is_gone() {
                    warn!(image = %tag, error = %e, "image removal failed");
                }
            }
        }
    }
}

/// Sorts specs so every dependency precedes its dependents.
///
/// The sort rotates blocked heads to the tail, pass by pass; a dependency
/// graph with no cycle settles in at most one pass per service. Passes are
/// capped at twice the service count; hitting the cap means a cycle.
/// Independent siblings keep their relative input order.
pub fn sort_by_dependency(specs: Vec<ServiceSpec>) -> Result<Vec<ServiceSpec>, ConfigError> {
    let cap = specs.len() * 2;
    let mut pending: VecDeque<ServiceSpec> = specs.into();
    let mut sorted: Vec<ServiceSpec> = Vec::with_capacity(pending.len());

    for _pass in 0..cap {
        if pending.is_empty() {
            break;
        }
        for _ in 0..pending.len() {
            let head = pending.pop_front().expect("pending is non-empty");
            let blocked = head
                .dependency_names()
                .iter()
                .any(|dep| *dep == head.name || pending.iter().any(|p| p.name == *dep));
            if blocked {
                pending.push_back(head);
            } else {
                sorted.push(head);
            }
        }
    }

    if !pending.is_empty() {
        return Err(ConfigError::DependencyCycle {
            services: pending.iter().map(|s| s.name.clone()).collect(),
        });
    }
    Ok(sorted)
}

/// Returns the tags to delete so at most `keep` remain, oldest first by
/// semantic version. Unparseable versions count as oldest.
fn select_images_to_remove(mut tags: Vec<String>, keep: usize) -> Vec<String> {
    if tags.len() <= keep {
        return Vec::new();
    }
    tags.sort_by(|a, b| {
        let va = parse_tag_version(a);
        let vb = parse_tag_version(b);
        match (va, vb) {
            (Some(va), Some(vb)) => va.cmp(&vb),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    });
    let excess = tags.len() - keep;
    tags.truncate(excess);
    tags
}

fn parse_tag_version(reference: &str) -> Option<Version> {
    let tag = reference.rsplit_once(':')?.1.trim_start_matches('v');
    // Tags like "0.4" are common; pad to a full semver triple.
    match Version::parse(tag) {
        Ok(v) => Some(v),
        Err(_) => Version::parse(&format!("{tag}.0")).ok(),
    }
}

/// Validation-only pass over a manifest: service specs, dependency order,
/// and registration config. Used by the daemon to fail fast at startup.
pub fn validate_manifest(manifest: &Manifest) -> Result<(), RuntimeError> {
    sort_by_dependency(manifest.service_specs()?)?;
    if manifest.registration.ip.is_none() {
        return Err(RegistryError::MissingIp.into());
    }
    Ok(())
}
