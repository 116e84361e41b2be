//! End-to-end reconciliation scenarios against the in-memory engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockEngine, MockStore};
use kiruna::{Application, EngineClient, Manifest, TtlStore};

fn two_service_manifest(etcd_tag: &str, hard_deploy: bool) -> Manifest {
    Manifest::from_json(&format!(
        r#"{{
            "Services": {{
                "etcd": {{
                    "Image": "coreos/etcd",
                    "Tag": "{etcd_tag}",
                    "HardDeploy": {hard_deploy},
                    "Ports": {{ "4001/tcp": 4001 }}
                }},
                "web-app": {{
                    "Image": "example/web",
                    "Tag": "1.0.0",
                    "Dependencies": ["etcd"],
                    "Register": false
                }}
            }},
            "Registration": {{ "Ip": "10.0.0.5", "Prefix": "services/" }}
        }}"#
    ))
    .expect("valid manifest")
}

struct Harness {
    engine: Arc<MockEngine>,
    store: Arc<MockStore>,
    client: Arc<EngineClient>,
}

impl Harness {
    fn new(engine: MockEngine) -> Self {
        let engine = Arc::new(engine);
        Self {
            client: Arc::new(EngineClient::new(Arc::clone(&engine) as Arc<dyn kiruna::Engine>)),
            store: Arc::new(MockStore::default()),
            engine,
        }
    }

    fn build(&self, manifest: &Manifest) -> Arc<Application> {
        Application::build(
            manifest,
            Arc::clone(&self.client),
            Arc::clone(&self.store) as Arc<dyn TtlStore>,
        )
        .expect("application builds")
    }
}

/// Lets watch ticks, queue jobs, and event routing run their course.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(120)).await;
}

#[tokio::test(start_paused = true)]
async fn cold_start_launches_in_dependency_order() {
    let h = Harness::new(MockEngine::new());
    let manifest = two_service_manifest("0.4.6", false);
    let app = h.build(&manifest);

    app.launch(None).await.expect("launch succeeds");
    settle().await;

    // Images were pulled in dependency order.
    assert_eq!(
        h.engine.pulls(),
        vec!["coreos/etcd:0.4.6".to_string(), "example/web:1.0.0".to_string()]
    );

    // etcd was created first, with the canonical replica-0 name.
    let creates = h.engine.creates();
    assert_eq!(creates.len(), 2, "exactly two containers created");
    assert!(creates[0].starts_with("etcd-"));
    assert!(creates[0].ends_with("__0_kir"));
    assert!(creates[1].starts_with("web-app-"));

    // The dependent's links point at etcd's replica-0 container.
    let etcd_name = app.service("etcd").unwrap().first_container_name();
    let web_name = app.service("web-app").unwrap().first_container_name();
    let web_start = h.engine.start_options(&web_name).expect("web was started");
    assert_eq!(web_start.links, vec![format!("{etcd_name}:etcd")]);

    // Nothing to clean on a cold start.
    assert!(h.engine.removed_containers().is_empty());
    assert!(app.is_up().await);

    // etcd's endpoints were registered with the configured prefix.
    assert!(h
        .store
        .keys()
        .contains(&"services/etcd/10.0.0.5:0:4001_tcp".to_string()));
}

#[tokio::test(start_paused = true)]
async fn unchanged_reload_creates_nothing() {
    let h = Harness::new(MockEngine::new());
    let manifest = two_service_manifest("0.4.6", false);

    let first = h.build(&manifest);
    first.launch(None).await.unwrap();
    settle().await;
    assert!(first.is_up().await);

    let creates_before = h.engine.creates().len();
    let pulls_before = h.engine.pulls().len();

    // Same manifest, new application generation.
    let second = h.build(&manifest);
    second.launch(Some(&first)).await.unwrap();
    settle().await;

    assert!(second.is_up().await);
    assert_eq!(h.engine.creates().len(), creates_before, "no new containers");
    assert_eq!(h.engine.pulls().len(), pulls_before, "no new pulls");
    assert!(h.engine.removed_containers().is_empty(), "nothing removed");
}

#[tokio::test(start_paused = true)]
async fn hard_deploy_replaces_previous_generation() {
    let h = Harness::new(MockEngine::new());

    let v1 = two_service_manifest("0.4.6", true);
    let first = h.build(&v1);
    first.launch(None).await.unwrap();
    settle().await;
    let old_etcd = first.service("etcd").unwrap().first_container_name();
    let web_name = first.service("web-app").unwrap().first_container_name();

    let v2 = two_service_manifest("0.5.0", true);
    let second = h.build(&v2);
    second.launch(Some(&first)).await.unwrap();
    settle().await;

    let new_etcd = second.service("etcd").unwrap().first_container_name();
    assert_ne!(old_etcd, new_etcd, "tag change rolls the generation hash");

    // Old generation is gone, new one is running.
    let removed = h.engine.removed_containers();
    assert!(removed.contains(&old_etcd), "old etcd was removed");
    assert!(removed.contains(&web_name), "dependent was stopped first");

    let running = h.engine.running_names();
    assert!(running.contains(&new_etcd));
    assert!(running.contains(&web_name), "dependent was relaunched");
    assert!(!running.contains(&old_etcd));

    // The relaunched dependent links against the new generation.
    let web_start = h.engine.start_options(&web_name).unwrap();
    assert_eq!(web_start.links, vec![format!("{new_etcd}:etcd")]);
    assert!(second.is_up().await);
}

#[tokio::test(start_paused = true)]
async fn dependency_collapse_cascades_and_recovers() {
    let h = Harness::new(MockEngine::new());
    let manifest = two_service_manifest("0.4.6", false);
    let app = h.build(&manifest);
    app.launch(None).await.unwrap();
    settle().await;
    assert!(app.is_up().await);

    let etcd_name = app.service("etcd").unwrap().first_container_name();
    let web_name = app.service("web-app").unwrap().first_container_name();

    // Kill etcd out from under the daemon.
    h.engine.kill(&etcd_name);
    settle().await;

    // etcd was replaced, web-app cascaded down and came back.
    assert!(app.is_up().await, "both services recovered");
    let creates = h.engine.creates();
    assert_eq!(
        creates.iter().filter(|n| *n == &etcd_name).count(),
        2,
        "etcd was recreated under the same canonical name"
    );
    assert_eq!(
        creates.iter().filter(|n| *n == &web_name).count(),
        2,
        "web-app stopped on the cascade and was recreated"
    );
    assert!(
        h.engine.removed_containers().contains(&web_name),
        "the cascade removed web-app's container"
    );
}

#[tokio::test(start_paused = true)]
async fn cleanup_never_touches_unowned_containers() {
    let engine = MockEngine::new();
    engine.seed_container("somebody-elses-db", true);
    engine.seed_container("etcd-feedfacefeedface__0_kir", false);
    let h = Harness::new(engine);

    let manifest = Manifest::from_json(
        r#"{
            "Services": {
                "etcd": { "Image": "coreos/etcd", "Tag": "0.4.6" }
            },
            "Registration": { "Ip": "10.0.0.5" }
        }"#,
    )
    .unwrap();
    let app = h.build(&manifest);
    app.launch(None).await.unwrap();
    settle().await;
    assert!(app.is_up().await);

    let names = h.engine.container_names();
    assert!(
        names.contains(&"somebody-elses-db".to_string()),
        "unowned container survives cleanup"
    );
    assert!(
        !names.iter().any(|n| n.contains("feedface")),
        "stale owned container was reaped"
    );
}

#[tokio::test(start_paused = true)]
async fn image_retention_keeps_current_plus_two() {
    let engine = MockEngine::new();
    for tag in ["0.1.0", "0.2.0", "0.3.0", "0.4.0"] {
        engine.seed_image(&format!("coreos/etcd:{tag}"));
    }
    let h = Harness::new(engine);

    let manifest = Manifest::from_json(
        r#"{
            "Services": {
                "etcd": { "Image": "coreos/etcd", "Tag": "0.4.6" }
            },
            "Registration": { "Ip": "10.0.0.5" }
        }"#,
    )
    .unwrap();
    let app = h.build(&manifest);
    app.launch(None).await.unwrap();
    settle().await;
    assert!(app.is_up().await);

    // Oldest tags pruned; the two newest old tags plus the current one
    // remain.
    let removed = h.engine.removed_images();
    assert_eq!(
        removed,
        vec!["coreos/etcd:0.1.0".to_string(), "coreos/etcd:0.2.0".to_string()]
    );
    let state = h.engine.state.lock().unwrap();
    assert!(state.images.contains("coreos/etcd:0.4.6"));
    assert!(state.images.contains("coreos/etcd:0.4.0"));
    assert!(state.images.contains("coreos/etcd:0.3.0"));
}

#[tokio::test(start_paused = true)]
async fn crash_looping_service_is_quarantined() {
    let h = Harness::new(MockEngine::crashy("crashy"));
    let manifest = Manifest::from_json(
        r#"{
            "Services": {
                "crashy": { "Image": "example/crashy", "Tag": "1.0.0" }
            },
            "Registration": { "Ip": "10.0.0.5" }
        }"#,
    )
    .unwrap();
    let app = h.build(&manifest);
    app.launch(None).await.unwrap();
    settle().await;

    // Initial attempt plus one per tolerated failure, then quarantine.
    let creates = h.engine.creates().len();
    assert_eq!(creates, (kiruna::MAX_FAILURES + 1) as usize);

    // Quarantine holds: no further restart attempts.
    settle().await;
    assert_eq!(h.engine.creates().len(), creates);
    assert!(!app.is_up().await);
}
