//! # ContainerRunner: single-container watch loop.
//!
//! One runner owns one engine container from the moment its service adopts
//! or creates it until a terminal stop. The runner inspects the container
//! on a timer, probes its health, republishes endpoints, and emits
//! edge-triggered lifecycle events.
//!
//! ## Tick flow
//! ```text
//! loop {
//!   ├─► sleep(watch_interval)      (cancellable; cancel = stopping, silent exit)
//!   ├─► inspect
//!   │     ├─► gone / engine error  → ContainerStopped, exit
//!   │     └─► not Running          → attach log tail once → ContainerStopped, exit
//!   ├─► run health probes
//!   │     ├─► healthy              → reset failures, republish endpoints,
//!   │     │                          interval = 15s, first time: ContainerStarted
//!   │     ├─► unhealthy, never started → interval = 250ms (startup detection)
//!   │     ├─► unhealthy, failures < 4  → count it, interval = 250ms
//!   │     └─► unhealthy, budget spent  → engine stop → ContainerStopped, exit
//! }
//! ```
//!
//! ## Rules
//! - At most one inspect/probe in flight per runner.
//! - `ContainerStarted` fires at most once and never regresses.
//! - `ContainerStopped` fires at most once; nothing runs after it.
//! - A cancelled (stopping) runner exits without emitting anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProbeSpec;
use crate::engine::EngineClient;
use crate::events::{Bus, Event, EventKind};
use crate::probe::HealthProbe;
use crate::registry::Registry;

/// Watch interval while waiting for a container to become healthy.
pub const FAST_WATCH: Duration = Duration::from_millis(250);

/// Watch interval once a container is healthy.
pub const STEADY_WATCH: Duration = Duration::from_secs(15);

/// Consecutive post-start health failures tolerated before the container
/// is stopped.
pub const MAX_HEALTH_FAILURES: u32 = 4;

/// Observable state shared between the watch task and its handle.
struct RunnerShared {
    /// Engine-assigned name, cached by the first inspect.
    name: Mutex<String>,
    /// Set after the first healthy probe; never cleared.
    started: AtomicBool,
    /// Set once the runner is terminally done.
    stopped: AtomicBool,
}

/// Dependencies a watch loop needs from its service.
#[derive(Clone)]
pub struct RunnerContext {
    /// Owning service name, used in events and registry keys.
    pub service: String,
    /// Publish endpoints on healthy ticks.
    pub register: bool,
    /// Serialized engine facade.
    pub engine: Arc<EngineClient>,
    /// Endpoint publisher.
    pub registry: Arc<Registry>,
    /// Event bus of the owning application.
    pub bus: Bus,
}

/// Handle to one live container's watch loop.
pub struct ContainerRunner {
    /// Engine container id.
    pub id: String,
    /// Replica index within the service.
    pub index: usize,
    shared: Arc<RunnerShared>,
    token: CancellationToken,
}

impl ContainerRunner {
    /// Adopts a container and spawns its watch loop.
    pub fn spawn(
        id: String,
        index: usize,
        probes: Vec<ProbeSpec>,
        ctx: RunnerContext,
        parent: &CancellationToken,
    ) -> Self {
        let shared = Arc::new(RunnerShared {
            name: Mutex::new(String::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        let token = parent.child_token();

        let task_shared = Arc::clone(&shared);
        let task_token = token.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            watch(task_id, index, probes, ctx, task_shared, task_token).await;
        });

        Self {
            id,
            index,
            shared,
            token,
        }
    }

    /// Marks the runner stopping; its loop exits silently on the next
    /// suspension point.
    pub fn mark_stopping(&self) {
        self.token.cancel();
    }

    /// True after the first healthy probe.
    pub fn has_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// True once the runner is terminally done.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Started, not stopped, and not marked stopping.
    pub fn is_running(&self) -> bool {
        self.has_started() && !self.is_stopped() && !self.token.is_cancelled()
    }

    /// Engine-assigned name cached by the first inspect.
    pub fn cached_name(&self) -> String {
        self.shared.name.lock().expect("name mutex poisoned").clone()
    }
}

async fn watch(
    id: String,
    index: usize,
    probes: Vec<ProbeSpec>,
    ctx: RunnerContext,
    shared: Arc<RunnerShared>,
    token: CancellationToken,
) {
    // One inspect up front to cache the engine-assigned name.
    match ctx.engine.inspect_container(&id).await {
        Ok(inspect) => {
            *shared.name.lock().expect("name mutex poisoned") =
                inspect.plain_name().to_string();
        }
        Err(e) => {
            warn!(service = %ctx.service, container = %id, error = %e, "initial inspect failed");
            emit_stopped(&ctx, &shared, index, &id);
            return;
        }
    }

    let probe = HealthProbe::new(probes);
    let mut interval = FAST_WATCH;
    let mut health_failures = 0u32;

    loop {
        let sleep = time::sleep(interval);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            _ = token.cancelled() => return,
        }
        if token.is_cancelled() {
            return;
        }

        let inspect = match ctx.engine.inspect_container(&id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                if e.is_gone() {
                    debug!(service = %ctx.service, container = %id, "container gone");
                } else {
                    warn!(service = %ctx.service, container = %id, error = %e, label = e.as_label(), "inspect failed");
                }
                emit_stopped(&ctx, &shared, index, &id);
                return;
            }
        };

        if !inspect.state.running {
            attach_logs(&ctx, &shared, &id).await;
            emit_stopped(&ctx, &shared, index, &id);
            return;
        }

        if probe.check(&inspect).await {
            health_failures = 0;
            if ctx.register {
                // Re-publish on every healthy tick; keys carry a TTL and
                // age out without this heartbeat.
                if let Err(e) = ctx.registry.publish(&ctx.service, index, &inspect).await {
                    warn!(service = %ctx.service, container = %id, error = %e, "endpoint publish failed");
                }
            }
            interval = STEADY_WATCH;
            if !shared.started.swap(true, Ordering::AcqRel) {
                info!(service = %ctx.service, container = %inspect.plain_name(), "container healthy");
                ctx.bus.publish(
                    Event::now(EventKind::ContainerStarted)
                        .with_service(&ctx.service)
                        .with_index(index)
                        .with_container(&id),
                );
            }
        } else if !shared.started.load(Ordering::Acquire) {
            // Still starting up; keep polling fast, no budget burned.
            interval = FAST_WATCH;
        } else if health_failures < MAX_HEALTH_FAILURES {
            health_failures += 1;
            debug!(
                service = %ctx.service, container = %id,
                failures = health_failures, "health check failed"
            );
            interval = FAST_WATCH;
        } else {
            warn!(service = %ctx.service, container = %id, "health budget exhausted, stopping container");
            if let Err(e) = ctx.engine.stop_container(&id).await {
                if !e.is_gone() {
                    warn!(container = %id, error = %e, "stop after failed health checks errored");
                }
            }
            emit_stopped(&ctx, &shared, index, &id);
            return;
        }
    }
}

/// One-shot attach of the dead container's output to the daemon log sink.
async fn attach_logs(ctx: &RunnerContext, shared: &RunnerShared, id: &str) {
    let name = shared.name.lock().expect("name mutex poisoned").clone();
    match ctx.engine.container_logs(id).await {
        Ok(tail) => {
            for line in tail.lines().filter(|l| !l.trim().is_empty()) {
                info!(target: "container", service = %ctx.service, container = %name, "{line}");
            }
        }
        Err(e) => debug!(container = %id, error = %e, "could not fetch container logs"),
    }
}

fn emit_stopped(ctx: &RunnerContext, shared: &RunnerShared, index: usize, id: &str) {
    if !shared.stopped.swap(true, Ordering::AcqRel) {
        ctx.bus.publish(
            Event::now(EventKind::ContainerStopped)
                .with_service(&ctx.service)
                .with_index(index)
                .with_container(id),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{HostPortSpec, HttpProbe, RegistrationConfig};
    use crate::engine::{
        ContainerInspect, ContainerState, ContainerSummary, CreateContainerOptions,
        CreateImageOptions, Engine, ImageInspect, ImageSummary, ProgressStream,
        StartContainerOptions,
    };
    use crate::error::{EngineError, RegistryError};
    use crate::registry::TtlStore;

    /// Minimal engine double driven by a scripted inspect response.
    struct ScriptedEngine {
        inspect: StdMutex<Result<ContainerInspect, ()>>,
        stops: StdMutex<Vec<String>>,
        log_fetches: StdMutex<u32>,
    }

    impl ScriptedEngine {
        fn running() -> Self {
            Self::with_inspect(Ok(ContainerInspect {
                id: "cid".into(),
                name: "/etcd-abc__0_kir".into(),
                state: ContainerState {
                    running: true,
                    exit_code: 0,
                },
                ..Default::default()
            }))
        }

        fn with_inspect(inspect: Result<ContainerInspect, ()>) -> Self {
            Self {
                inspect: StdMutex::new(inspect),
                stops: StdMutex::new(Vec::new()),
                log_fetches: StdMutex::new(0),
            }
        }

        fn set_running(&self, running: bool) {
            if let Ok(inspect) = &mut *self.inspect.lock().unwrap() {
                inspect.state.running = running;
            }
        }
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, EngineError> {
            match &*self.inspect.lock().unwrap() {
                Ok(inspect) => Ok(inspect.clone()),
                Err(()) => Err(EngineError::NoSuchContainer { name: name.into() }),
            }
        }
        async fn create_container(
            &self,
            _opts: &CreateContainerOptions,
        ) -> Result<String, EngineError> {
            unimplemented!("not used in runner tests")
        }
        async fn start_container(
            &self,
            _id: &str,
            _opts: &StartContainerOptions,
        ) -> Result<(), EngineError> {
            unimplemented!("not used in runner tests")
        }
        async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
            self.stops.lock().unwrap().push(id.to_string());
            self.set_running(false);
            Ok(())
        }
        async fn remove_container(&self, _id: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
            Ok(Vec::new())
        }
        async fn inspect_image(&self, r: &str) -> Result<ImageInspect, EngineError> {
            Err(EngineError::NoSuchImage {
                reference: r.into(),
            })
        }
        async fn create_image(
            &self,
            _opts: &CreateImageOptions,
        ) -> Result<ProgressStream, EngineError> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
            Ok(Vec::new())
        }
        async fn remove_image(&self, _r: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn container_logs(&self, _id: &str) -> Result<String, EngineError> {
            *self.log_fetches.lock().unwrap() += 1;
            Ok("last words\n".into())
        }
    }

    struct NullStore;

    #[async_trait]
    impl TtlStore for NullStore {
        async fn put(&self, _k: &str, _v: &str, _t: Duration) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    fn context(engine: Arc<ScriptedEngine>, bus: &Bus) -> RunnerContext {
        let registry = Registry::from_config(
            &RegistrationConfig {
                ip: Some("10.0.0.5".into()),
                ..Default::default()
            },
            Arc::new(NullStore),
        )
        .unwrap();
        RunnerContext {
            service: "etcd".into(),
            register: false,
            engine: Arc::new(EngineClient::new(engine)),
            registry: Arc::new(registry),
            bus: bus.clone(),
        }
    }

    fn count_events(rx: &mut tokio::sync::broadcast::Receiver<Event>, kind: EventKind) -> usize {
        let mut n = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == kind {
                n += 1;
            }
        }
        n
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_container_emits_started_exactly_once() {
        let engine = Arc::new(ScriptedEngine::running());
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();

        let runner = ContainerRunner::spawn(
            "cid".into(),
            0,
            Vec::new(),
            context(engine, &bus),
            &CancellationToken::new(),
        );

        // Several steady intervals pass; started must fire only once.
        time::sleep(Duration::from_secs(60)).await;
        assert!(runner.is_running());
        assert_eq!(runner.cached_name(), "etcd-abc__0_kir");
        assert_eq!(count_events(&mut rx, EventKind::ContainerStarted), 1);
        assert_eq!(count_events(&mut rx, EventKind::ContainerStopped), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_container_emits_stopped_once() {
        let engine = Arc::new(ScriptedEngine::running());
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();

        let runner = ContainerRunner::spawn(
            "cid".into(),
            0,
            Vec::new(),
            context(Arc::clone(&engine), &bus),
            &CancellationToken::new(),
        );
        time::sleep(Duration::from_secs(1)).await;
        assert!(runner.has_started());

        // Pull the container out from under the runner.
        *engine.inspect.lock().unwrap() = Err(());
        time::sleep(Duration::from_secs(60)).await;

        assert!(runner.is_stopped());
        assert_eq!(count_events(&mut rx, EventKind::ContainerStopped), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exited_container_attaches_logs_then_stops() {
        let engine = Arc::new(ScriptedEngine::running());
        engine.set_running(false);
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();

        let runner = ContainerRunner::spawn(
            "cid".into(),
            0,
            Vec::new(),
            context(Arc::clone(&engine), &bus),
            &CancellationToken::new(),
        );
        time::sleep(Duration::from_secs(5)).await;

        assert!(runner.is_stopped());
        assert!(!runner.has_started());
        assert_eq!(*engine.log_fetches.lock().unwrap(), 1);
        assert_eq!(count_events(&mut rx, EventKind::ContainerStarted), 0);
        assert_eq!(count_events(&mut rx, EventKind::ContainerStopped), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_from_start_never_emits_started() {
        let engine = Arc::new(ScriptedEngine::running());
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();

        // Probe against a port with no host binding: unhealthy forever.
        let probes = vec![ProbeSpec::Http {
            http: HttpProbe {
                port: HostPortSpec::Port(8080),
                ..Default::default()
            },
        }];
        let runner = ContainerRunner::spawn(
            "cid".into(),
            0,
            probes,
            context(Arc::clone(&engine), &bus),
            &CancellationToken::new(),
        );

        // Startup-phase failures burn no budget and never stop the loop.
        time::sleep(Duration::from_secs(30)).await;
        assert!(!runner.has_started());
        assert!(!runner.is_stopped());
        assert!(engine.stops.lock().unwrap().is_empty());
        assert_eq!(count_events(&mut rx, EventKind::ContainerStarted), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_runner_exits_silently() {
        let engine = Arc::new(ScriptedEngine::running());
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();

        let runner = ContainerRunner::spawn(
            "cid".into(),
            0,
            Vec::new(),
            context(engine, &bus),
            &CancellationToken::new(),
        );
        time::sleep(Duration::from_secs(1)).await;
        let _ = count_events(&mut rx, EventKind::ContainerStarted);

        runner.mark_stopping();
        time::sleep(Duration::from_secs(120)).await;
        assert!(!runner.is_running());
        assert_eq!(count_events(&mut rx, EventKind::ContainerStopped), 0);
    }
}
