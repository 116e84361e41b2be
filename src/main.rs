//! Daemon entrypoint: load the manifest, wire the engine and registration
//! store, watch the config file for changes, and supervise until a
//! termination signal arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use kiruna::{
    validate_manifest, EngineClient, HttpEngine, HttpStore, LoggingConfig, Manifest, Supervisor,
    TtlStore,
};

/// Environment variable overriding the manifest path.
const CONF_ENV: &str = "KIRUNA_CONF";

/// Manifest filename looked up in the working directory.
const CONF_FILE: &str = "kiruna.conf";

/// Quiet window after a file event before the change is applied.
const DEBOUNCE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path();
    let manifest = Manifest::load(&config_path)
        .with_context(|| format!("cannot load manifest at {}", config_path.display()))?;
    init_tracing(&manifest.logging);
    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path.display(), "kiruna starting");

    // Fail fast on structural problems: validation and registration
    // misconfiguration are fatal at startup, not mid-rollout.
    validate_manifest(&manifest).context("invalid manifest")?;
    let registration_url = manifest
        .registration
        .url
        .clone()
        .context("Registration.Url is required")?;

    let engine = Arc::new(EngineClient::new(Arc::new(HttpEngine::from_env())));
    let store: Arc<dyn TtlStore> = Arc::new(HttpStore::new(registration_url));
    let supervisor = Supervisor::new(config_path.clone(), engine, store);

    let token = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&supervisor).run(token.child_token()));

    // Keep the watcher alive for the daemon's lifetime.
    let _watcher = spawn_config_watcher(&config_path, Arc::clone(&supervisor), token.child_token())
        .context("cannot watch manifest for changes")?;

    wait_for_shutdown_signal()
        .await
        .context("signal handler registration failed")?;
    info!("shutdown requested");

    token.cancel();
    if let Some(app) = supervisor.active().await {
        // Stop restarting; leave containers running without their watchdog.
        app.mark_stopping();
    }
    let _ = run.await;
    info!("bye");
    Ok(())
}

/// `KIRUNA_CONF` or `kiruna.conf` in the working directory.
fn config_path() -> PathBuf {
    std::env::var(CONF_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CONF_FILE))
}

/// Console logging per the manifest, overridable with `RUST_LOG`.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.console.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Watches the manifest file and forwards debounced change notifications
/// to the supervisor.
fn spawn_config_watcher(
    path: &Path,
    supervisor: Arc<Supervisor>,
    token: CancellationToken,
) -> Result<notify::RecommendedWatcher> {
    let (tx, mut rx) = mpsc::channel::<()>(16);
    let mut watcher = notify::recommended_watcher(
        move |res: std::result::Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.blocking_send(());
                }
            }
            Err(e) => warn!(error = %e, "config watcher error"),
        },
    )?;

    // Watch the parent directory; editors commonly replace the file, which
    // would orphan a watch on the path itself.
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    watcher.watch(dir.unwrap_or(Path::new(".")), RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = rx.recv() => {
                    if msg.is_none() {
                        break;
                    }
                    // Collapse the burst an editor save produces.
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(DEBOUNCE) => break,
                            more = rx.recv() => {
                                if more.is_none() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!("manifest changed on disk");
                    supervisor.notify_change();
                }
            }
        }
    });
    Ok(watcher)
}

/// Completes when the process receives a termination signal.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Completes when the process receives a termination signal.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
