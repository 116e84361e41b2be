//! # Service: rollout state machine for one manifest entry.
//!
//! A [`Service`] owns up to `Scale` [`ContainerRunner`]s, a dependency-aware
//! start gate, and a single-writer [`WorkQueue`]. Every mutating operation
//! (launch, stop, start replicas, retire old generations, reactions to
//! container and dependency events) runs as a job on the queue, in
//! submission order, so no two rollouts of the same service interleave.
//!
//! ## Launch flow
//! ```text
//! launch
//!   ├─► collect: adopt running containers with current-generation names
//!   ├─► nothing adopted + HardDeploy → stop (dependents first, then
//!   │                                  remove every owned container)
//!   ├─► launched = true
//!   └─► start replicas 0..Scale
//!         ├─► any dependency not running → wait for its started event
//!         ├─► index running      → adopt
//!         ├─► index exists, dead → remove, recreate, start, adopt
//!         └─► index missing      → create, start, adopt
//! ```
//!
//! ## Event aggregation
//! - runner started: running count 0→1 emits `ServiceStarted`; count equal
//!   to `Scale` emits `ServiceAllStarted` and schedules retirement of the
//!   previous generation (after the optional settle timeout).
//! - runner stopped: the casualty is dropped and replaced, unless the
//!   service is stopping or has burned through [`MAX_FAILURES`] recent
//!   failures, in which case it is quarantined until the next config
//!   change.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use futures::StreamExt;

use crate::app::Application;
use crate::config::{split_host_port, ServiceSpec};
use crate::engine::{
    CreateContainerOptions, CreateImageOptions, EngineClient, PortBinding, StartContainerOptions,
};
use crate::error::EngineError;
use crate::events::{Bus, Event, EventKind};
use crate::registry::Registry;
use crate::runner::{ContainerRunner, RunnerContext};
use crate::service::naming;
use crate::service::queue::WorkQueue;

/// Replica failures tolerated before a service stops restarting its
/// containers. The quarantine lasts until the next config change.
pub const MAX_FAILURES: u32 = 20;

struct ServiceState {
    runners: Vec<ContainerRunner>,
    recent_failures: u32,
    launched: bool,
    stopping: bool,
}

/// Runtime object for one manifest entry.
pub struct Service {
    spec: ServiceSpec,
    hash: String,
    engine: Arc<EngineClient>,
    registry: Arc<Registry>,
    bus: Bus,
    queue: WorkQueue,
    token: CancellationToken,
    app: Weak<Application>,
    state: Mutex<ServiceState>,
    /// Transitive dependency closure, linked once after the application's
    /// topological sort; sorted by name.
    deps: StdRwLock<Vec<Arc<Service>>>,
}

impl Service {
    pub(crate) fn new(
        spec: ServiceSpec,
        engine: Arc<EngineClient>,
        registry: Arc<Registry>,
        bus: Bus,
        app: Weak<Application>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let hash = naming::generation_hash(&spec);
        let token = parent.child_token();
        let queue = WorkQueue::new(token.clone());
        Arc::new(Self {
            spec,
            hash,
            engine,
            registry,
            bus,
            queue,
            token,
            app,
            state: Mutex::new(ServiceState {
                runners: Vec::new(),
                recent_failures: 0,
                launched: false,
                stopping: false,
            }),
            deps: StdRwLock::new(Vec::new()),
        })
    }

    /// Service name from the manifest.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The immutable spec this service reconciles toward.
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Current generation hash.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Disabled services are skipped by the launch pipeline.
    pub fn is_enabled(&self) -> bool {
        self.spec.enabled
    }

    /// Canonical container name for one replica index.
    pub fn container_name_for(&self, index: usize) -> String {
        naming::container_name(&self.spec.name, &self.hash, index)
    }

    /// Canonical name of replica 0, used as the link target by dependents.
    pub fn first_container_name(&self) -> String {
        self.container_name_for(0)
    }

    // ---- dependency wiring ----

    /// Resolves direct dependency names against `all` and takes the union
    /// with each direct dependency's already-linked transitive closure.
    ///
    /// Must run in topological order so the closure of every dependency is
    /// complete by the time it is consulted.
    pub(crate) fn link_dependencies(&self, all: &[Arc<Service>]) {
        let mut linked: Vec<Arc<Service>> = Vec::new();
        for dep_name in self.spec.dependency_names() {
            let Some(dep) = all.iter().find(|s| s.name() == dep_name) else {
                continue;
            };
            for transitive in dep.dependencies() {
                if !linked.iter().any(|d| d.name() == transitive.name()) {
                    linked.push(transitive);
                }
            }
            if !linked.iter().any(|d| d.name() == dep.name()) {
                linked.push(Arc::clone(dep));
            }
        }
        linked.sort_by(|a, b| a.name().cmp(b.name()));
        *self.deps.write().expect("deps lock poisoned") = linked;
    }

    /// Snapshot of the transitive dependency closure.
    pub fn dependencies(&self) -> Vec<Arc<Service>> {
        self.deps.read().expect("deps lock poisoned").clone()
    }

    /// True when `name` is in this service's transitive closure.
    pub fn depends_on(&self, name: &str) -> bool {
        self.deps
            .read()
            .expect("deps lock poisoned")
            .iter()
            .any(|d| d.name() == name)
    }

    // ---- state queries ----

    /// True when at least one replica is running.
    pub async fn has_running(&self) -> bool {
        self.state
            .lock()
            .await
            .runners
            .iter()
            .any(|r| r.is_running())
    }

    /// Number of currently running replicas.
    pub async fn running_count(&self) -> usize {
        self.state
            .lock()
            .await
            .runners
            .iter()
            .filter(|r| r.is_running())
            .count()
    }

    /// Ids of every live container this service currently owns.
    pub async fn current_container_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .runners
            .iter()
            .map(|r| r.id.clone())
            .collect()
    }

    // ---- external entry points (queued) ----

    /// Runs the full launch sequence on the work queue and waits for it.
    pub async fn launch(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let _ = self.queue.submit(async move { me.launch_inner().await }).await;
    }

    /// Stops this service (dependents first) on the work queue and waits.
    pub fn stop(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let me = Arc::clone(self);
        let queue = self.queue.clone();
        Box::pin(async move {
            let fut: Pin<Box<dyn Future<Output = ()> + Send>> =
                Box::pin(async move { me.stop_inner().await });
            let _ = queue.submit(fut).await;
        })
    }

    /// Queues the reaction to one of this service's containers becoming
    /// healthy.
    pub(crate) fn notify_container_started(self: &Arc<Self>, id: String) {
        let me = Arc::clone(self);
        self.queue
            .push(async move { me.on_container_started_inner(id).await });
    }

    /// Queues the reaction to one of this service's containers going away.
    pub(crate) fn notify_container_stopped(self: &Arc<Self>, id: String) {
        let me = Arc::clone(self);
        self.queue
            .push(async move { me.on_container_stopped_inner(id).await });
    }

    /// Queues the resume-start reaction to a dependency coming up.
    pub(crate) fn notify_dependency_started(self: &Arc<Self>, dep: String) {
        let me = Arc::clone(self);
        self.queue
            .push(async move { me.on_dependency_started_inner(dep).await });
    }

    /// Queues the cascade-stop reaction to a dependency going down.
    pub(crate) fn notify_dependency_stopped(self: &Arc<Self>, dep: String) {
        let me = Arc::clone(self);
        self.queue.push(async move {
            info!(service = me.name(), dependency = %dep, "dependency stopped, stopping");
            me.stop_inner().await;
        });
    }

    // ---- image pull ----

    /// Ensures `image:tag` is available locally, pulling it if necessary.
    ///
    /// The progress stream is consumed to end-of-stream; any stream error
    /// is fatal to the pull.
    pub async fn pull_image(&self) -> Result<(), EngineError> {
        let reference = self.spec.image_ref();
        if self.engine.inspect_image(&reference).await.is_ok() {
            debug!(service = self.name(), image = %reference, "image already local");
            return Ok(());
        }

        info!(service = self.name(), image = %reference, "pulling image");
        let opts = CreateImageOptions {
            from_image: self.spec.image.clone(),
            tag: self.spec.tag.clone(),
            registry: self.spec.registry.clone(),
        };
        let mut progress = self.engine.create_image(&opts).await?;
        while let Some(item) = progress.next().await {
            item?;
        }
        self.engine.inspect_image(&reference).await?;
        Ok(())
    }

    // ---- rollout steps (run on the work queue) ----

    async fn launch_inner(self: Arc<Self>) {
        self.state.lock().await.stopping = false;

        let adopted = self.collect_running_containers().await;
        if adopted == 0 && self.spec.hard_deploy {
            info!(service = self.name(), "hard deploy, stopping previous generation first");
            self.stop_inner().await;
            // The stop above is teardown of the old generation, not a
            // directive against this rollout.
            self.state.lock().await.stopping = false;
        }

        self.state.lock().await.launched = true;
        self.start_containers_inner().await;
    }

    /// Adopts every current-generation container that is already running.
    async fn collect_running_containers(self: &Arc<Self>) -> usize {
        let mut adopted = 0;
        for index in 0..self.spec.scale {
            let name = self.container_name_for(index);
            match self.engine.inspect_container(&name).await {
                Ok(inspect) if inspect.state.running => {
                    debug!(service = self.name(), container = %name, "adopting running container");
                    self.adopt(inspect.id, index).await;
                    adopted += 1;
                }
                Ok(_) => {} // exists but stopped; the start phase replaces it
                Err(e) if e.is_gone() => {}
                Err(e) => {
                    warn!(service = self.name(), container = %name, error = %e, "inspect during collection failed");
                }
            }
        }
        adopted
    }

    async fn start_containers_inner(self: &Arc<Self>) {
        {
            let state = self.state.lock().await;
            if state.stopping {
                return;
            }
            if state.recent_failures > MAX_FAILURES {
                error!(
                    service = self.name(),
                    failures = state.recent_failures,
                    "service is quarantined until the next config change"
                );
                return;
            }
        }
        if self.token.is_cancelled() {
            return;
        }

        for dep in self.dependencies() {
            if dep.is_enabled() && !dep.has_running().await {
                info!(
                    service = self.name(),
                    dependency = dep.name(),
                    "dependency not running, deferring start"
                );
                return;
            }
        }

        for index in 0..self.spec.scale {
            if self.has_runner_for(index).await {
                continue;
            }
            let name = self.container_name_for(index);
            match self.engine.inspect_container(&name).await {
                Ok(inspect) if inspect.state.running => {
                    self.adopt(inspect.id, index).await;
                }
                Ok(inspect) => {
                    // A dead container under the canonical name blocks the
                    // name; clear it and recreate.
                    if let Some(app) = self.app.upgrade() {
                        if let Err(e) = app.stop_and_remove_container(&inspect.id).await {
                            warn!(service = self.name(), container = %name, error = %e, "could not clear dead container");
                            continue;
                        }
                    }
                    self.create_and_start(index, &name).await;
                }
                Err(e) if e.is_gone() => {
                    self.create_and_start(index, &name).await;
                }
                Err(e) => {
                    warn!(service = self.name(), container = %name, error = %e, label = e.as_label(), "inspect before start failed");
                }
            }
        }
    }

    async fn create_and_start(self: &Arc<Self>, index: usize, name: &str) {
        let create = build_create_options(&self.spec, name);
        let start = build_start_options(&self.spec, self.link_targets());

        let id = match self.engine.create_container(&create).await {
            Ok(id) => id,
            Err(e) => {
                warn!(service = self.name(), container = %name, error = %e, label = e.as_label(), "create failed");
                return;
            }
        };
        if let Err(e) = self.engine.start_container(&id, &start).await {
            warn!(service = self.name(), container = %name, error = %e, label = e.as_label(), "start failed");
            return;
        }
        info!(service = self.name(), container = %name, "container started");
        self.adopt(id, index).await;
    }

    /// Links as `<depFirstContainerName>:<alias>` for every direct
    /// dependency entry.
    fn link_targets(&self) -> Vec<String> {
        let deps = self.deps.read().expect("deps lock poisoned");
        self.spec
            .dependency_pairs()
            .into_iter()
            .filter_map(|(dep_name, alias)| {
                deps.iter()
                    .find(|d| d.name() == dep_name)
                    .map(|d| format!("{}:{alias}", d.first_container_name()))
            })
            .collect()
    }

    async fn adopt(self: &Arc<Self>, id: String, index: usize) {
        let mut state = self.state.lock().await;
        if state
            .runners
            .iter()
            .any(|r| r.index == index && !r.is_stopped())
        {
            return;
        }
        let ctx = RunnerContext {
            service: self.spec.name.clone(),
            register: self.spec.register,
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            bus: self.bus.clone(),
        };
        let runner = ContainerRunner::spawn(id, index, self.spec.health.clone(), ctx, &self.token);
        state.runners.push(runner);
    }

    async fn has_runner_for(&self, index: usize) -> bool {
        self.state
            .lock()
            .await
            .runners
            .iter()
            .any(|r| r.index == index && !r.is_stopped())
    }

    /// Stops and removes containers of previous generations.
    ///
    /// `force` widens the selection to the current generation as well; the
    /// stop path uses it to clear everything this service owns.
    async fn stop_old_containers_inner(&self, force: bool) {
        let listing = match self.engine.list_containers(true).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(service = self.name(), error = %e, "container listing failed");
                return;
            }
        };
        let Some(app) = self.app.upgrade() else {
            return;
        };

        for container in &listing {
            let raw = container.names.first().map(String::as_str).unwrap_or("");
            let selected = if force {
                naming::belongs_to_service(raw, &self.spec.name)
            } else {
                naming::is_old_generation(raw, &self.spec.name, &self.hash)
            };
            if !selected {
                continue;
            }
            info!(service = self.name(), container = %raw, "retiring container");
            if let Err(e) = app.stop_and_remove_container(&container.id).await {
                warn!(service = self.name(), container = %raw, error = %e, "retire failed");
            }
        }
    }

    async fn stop_inner(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.stopping = true;
            for runner in &state.runners {
                runner.mark_stopping();
            }
            state.runners.clear();
        }
        if let Some(app) = self.app.upgrade() {
            app.stop_dependents(self.name()).await;
        }
        self.stop_old_containers_inner(true).await;
    }

    // ---- container event aggregation ----

    async fn on_container_started_inner(self: &Arc<Self>, _id: String) {
        let running = {
            let mut state = self.state.lock().await;
            if state.recent_failures > 0 {
                state.recent_failures -= 1;
            }
            state.runners.iter().filter(|r| r.is_running()).count()
        };

        if running == 1 {
            self.bus
                .publish(Event::now(EventKind::ServiceStarted).with_service(self.name()));
        }
        if running == self.spec.scale {
            info!(service = self.name(), replicas = running, "all replicas running");
            self.bus
                .publish(Event::now(EventKind::ServiceAllStarted).with_service(self.name()));
            self.schedule_retirement();
        }
    }

    async fn on_container_stopped_inner(self: &Arc<Self>, id: String) {
        let (any_running, failures, stopping) = {
            let mut state = self.state.lock().await;
            state.runners.retain(|r| r.id != id);
            state.recent_failures += 1;
            (
                state.runners.iter().any(|r| r.is_running()),
                state.recent_failures,
                state.stopping,
            )
        };

        if !any_running {
            self.bus
                .publish(Event::now(EventKind::ServiceStopped).with_service(self.name()));
        }
        if failures > MAX_FAILURES {
            error!(
                service = self.name(),
                failures, "too many replica failures, quarantining until the next config change"
            );
            return;
        }
        if stopping || self.token.is_cancelled() {
            return;
        }
        self.start_containers_inner().await;
    }

    async fn on_dependency_started_inner(self: &Arc<Self>, dep: String) {
        {
            let mut state = self.state.lock().await;
            if !state.launched {
                return;
            }
            // A cascade-stop triggered by this dependency is over now.
            state.stopping = false;
        }
        debug!(service = self.name(), dependency = %dep, "dependency started, resuming start");
        self.start_containers_inner().await;
    }

    /// After all replicas are healthy, retire the previous generation once
    /// the settle timeout (if any) has elapsed.
    fn schedule_retirement(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let token = self.token.clone();
        let delay = Duration::from_millis(self.spec.settle_timeout_ms.unwrap_or(0));
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = time::sleep(delay) => {}
                    _ = token.cancelled() => return,
                }
            }
            let job_me = Arc::clone(&me);
            me.queue
                .push(async move { job_me.stop_old_containers_inner(false).await });
        });
    }
}

/// Create-time option mapping from the spec.
fn build_create_options(spec: &ServiceSpec, name: &str) -> CreateContainerOptions {
    let mut opts = CreateContainerOptions {
        name: name.to_string(),
        image: spec.image_ref(),
        ..Default::default()
    };
    for port in &spec.expose {
        opts.exposed_ports
            .insert(port_proto_key(port), Default::default());
    }
    for (key, value) in &spec.environment {
        opts.env.push(format!("{key}={value}"));
    }
    opts.cmd = spec.cmd.clone();
    opts
}

/// Start-time option mapping from the spec.
fn build_start_options(spec: &ServiceSpec, links: Vec<String>) -> StartContainerOptions {
    let mut opts = StartContainerOptions {
        publish_all_ports: spec.publish_all_ports,
        links,
        ..Default::default()
    };
    for (container_port, host_spec) in &spec.ports {
        let binding = split_host_port(host_spec);
        opts.port_bindings.insert(
            port_proto_key(container_port),
            vec![PortBinding {
                host_ip: binding.host_ip,
                host_port: Some(binding.host_port),
            }],
        );
    }
    for (container_path, host_path) in &spec.volumes {
        opts.binds.push(format!("{host_path}:{container_path}"));
    }
    opts
}

/// Engine port keys carry a protocol; bare manifest ports assume tcp.
fn port_proto_key(raw: &str) -> String {
    if raw.contains('/') {
        raw.to_string()
    } else {
        format!("{raw}/tcp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostPortSpec;

    fn spec() -> ServiceSpec {
        let mut spec = ServiceSpec {
            name: "web".into(),
            image: "example/web".into(),
            tag: "1.0.0".into(),
            publish_all_ports: true,
            ..Default::default()
        };
        spec.expose.insert("9090".into());
        spec.environment.insert("MODE".into(), "prod".into());
        spec.volumes
            .insert("/data".into(), "/var/lib/web".into());
        spec.cmd = vec!["serve".into(), "--port=8080".into()];
        spec.ports
            .insert("8080/tcp".into(), HostPortSpec::Spec("10.0.0.5:80".into()));
        spec.ports.insert("9090".into(), HostPortSpec::Port(9090));
        spec
    }

    #[test]
    fn create_options_map_spec_fields() {
        let opts = build_create_options(&spec(), "web-abc__0_kir");
        assert_eq!(opts.name, "web-abc__0_kir");
        assert_eq!(opts.image, "example/web:1.0.0");
        assert!(opts.exposed_ports.contains_key("9090/tcp"));
        assert_eq!(opts.env, vec!["MODE=prod".to_string()]);
        assert_eq!(opts.cmd, vec!["serve".to_string(), "--port=8080".to_string()]);
    }

    #[test]
    fn start_options_map_bindings_links_and_binds() {
        let opts = build_start_options(
            &spec(),
            vec!["etcd-deadbeef__0_kir:etcd".to_string()],
        );
        assert!(opts.publish_all_ports);
        assert_eq!(opts.links, vec!["etcd-deadbeef__0_kir:etcd".to_string()]);
        assert_eq!(opts.binds, vec!["/var/lib/web:/data".to_string()]);

        let explicit = &opts.port_bindings["8080/tcp"];
        assert_eq!(explicit[0].host_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(explicit[0].host_port.as_deref(), Some("80"));

        // Numeric host port spec carries no bind address.
        let numeric = &opts.port_bindings["9090/tcp"];
        assert_eq!(numeric[0].host_ip, None);
        assert_eq!(numeric[0].host_port.as_deref(), Some("9090"));
    }

    #[test]
    fn bare_ports_assume_tcp() {
        assert_eq!(port_proto_key("8080"), "8080/tcp");
        assert_eq!(port_proto_key("53/udp"), "53/udp");
    }
}
