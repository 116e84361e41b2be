//! In-memory engine and registration-store doubles for end-to-end
//! reconciliation tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use kiruna::{
    ContainerInspect, ContainerState, ContainerSummary, CreateContainerOptions,
    CreateImageOptions, Engine, EngineError, ImageInspect, ImageSummary, NetworkSettings,
    PortBinding, ProgressStream, RegistryError, StartContainerOptions, TtlStore,
};

/// One simulated container.
#[derive(Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Default)]
pub struct MockState {
    pub containers: Vec<MockContainer>,
    pub images: BTreeSet<String>,
    pub pulls: Vec<String>,
    pub creates: Vec<String>,
    pub removed_containers: Vec<String>,
    pub removed_images: Vec<String>,
    pub starts: HashMap<String, StartContainerOptions>,
    pub stops: Vec<String>,
    next_id: u64,
}

/// Scriptable in-memory container engine.
#[derive(Default)]
pub struct MockEngine {
    pub state: Mutex<MockState>,
    /// Containers whose name starts with this prefix exit immediately on
    /// start, simulating a crash loop.
    pub crashy_prefix: Option<String>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn crashy(prefix: &str) -> Self {
        Self {
            crashy_prefix: Some(prefix.to_string()),
            ..Default::default()
        }
    }

    pub fn seed_image(&self, reference: &str) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(reference.to_string());
    }

    pub fn seed_container(&self, name: &str, running: bool) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("seed-{}", state.next_id);
        state.containers.push(MockContainer {
            id,
            name: name.to_string(),
            running,
            ports: BTreeMap::new(),
        });
    }

    /// Points a container port binding at the given host port.
    pub fn set_port(&self, name: &str, key: &str, host_ip: &str, host_port: u16) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.name == name) {
            c.ports.insert(
                key.to_string(),
                Some(vec![PortBinding {
                    host_ip: Some(host_ip.to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }
    }

    pub fn stops(&self) -> Vec<String> {
        self.state.lock().unwrap().stops.clone()
    }

    /// Simulates an external kill: the container stays listed but leaves
    /// the Running state.
    pub fn kill(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.name == name) {
            c.running = false;
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn running_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn creates(&self) -> Vec<String> {
        self.state.lock().unwrap().creates.clone()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_containers.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_images.clone()
    }

    pub fn start_options(&self, name: &str) -> Option<StartContainerOptions> {
        self.state.lock().unwrap().starts.get(name).cloned()
    }

    fn inspect_of(c: &MockContainer) -> ContainerInspect {
        ContainerInspect {
            id: c.id.clone(),
            name: format!("/{}", c.name),
            state: ContainerState {
                running: c.running,
                exit_code: if c.running { 0 } else { 1 },
            },
            network_settings: NetworkSettings {
                ports: c.ports.clone(),
            },
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerInspect, EngineError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
            .map(Self::inspect_of)
            .ok_or_else(|| EngineError::NoSuchContainer {
                name: id_or_name.to_string(),
            })
    }

    async fn create_container(&self, opts: &CreateContainerOptions) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains(&opts.image) {
            return Err(EngineError::NoSuchImage {
                reference: opts.image.clone(),
            });
        }
        if state.containers.iter().any(|c| c.name == opts.name) {
            return Err(EngineError::Api {
                status: 409,
                message: format!("name {} already in use", opts.name),
            });
        }
        state.next_id += 1;
        let id = format!("id-{}", state.next_id);
        state.creates.push(opts.name.clone());
        state.containers.push(MockContainer {
            id: id.clone(),
            name: opts.name.clone(),
            running: false,
            ports: BTreeMap::new(),
        });
        Ok(id)
    }

    async fn start_container(
        &self,
        id: &str,
        opts: &StartContainerOptions,
    ) -> Result<(), EngineError> {
        let crashy = self.crashy_prefix.clone();
        let mut state = self.state.lock().unwrap();
        let Some(c) = state.containers.iter_mut().find(|c| c.id == id) else {
            return Err(EngineError::NoSuchContainer {
                name: id.to_string(),
            });
        };
        c.running = !crashy
            .map(|p| c.name.starts_with(&p))
            .unwrap_or(false);
        for (key, bindings) in &opts.port_bindings {
            let host_port = bindings
                .first()
                .and_then(|b| b.host_port.clone())
                .unwrap_or_else(|| "49000".to_string());
            c.ports.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".into()),
                    host_port: Some(host_port),
                }]),
            );
        }
        let name = c.name.clone();
        state.starts.insert(name, opts.clone());
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let Some(c) = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.name == id)
        else {
            return Err(EngineError::NoSuchContainer {
                name: id.to_string(),
            });
        };
        c.running = false;
        let name = c.name.clone();
        state.stops.push(name);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state
            .containers
            .iter()
            .position(|c| c.id == id || c.name == id)
        else {
            return Err(EngineError::NoSuchContainer {
                name: id.to_string(),
            });
        };
        let removed = state.containers.remove(pos);
        state.removed_containers.push(removed.name);
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                image: String::new(),
                state: if c.running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, EngineError> {
        let state = self.state.lock().unwrap();
        if state.images.contains(reference) {
            Ok(ImageInspect {
                id: format!("img-{reference}"),
                repo_tags: vec![reference.to_string()],
            })
        } else {
            Err(EngineError::NoSuchImage {
                reference: reference.to_string(),
            })
        }
    }

    async fn create_image(&self, opts: &CreateImageOptions) -> Result<ProgressStream, EngineError> {
        let reference = format!("{}:{}", opts.from_image, opts.tag);
        let mut state = self.state.lock().unwrap();
        state.pulls.push(reference.clone());
        state.images.insert(reference);
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .images
            .iter()
            .map(|reference| ImageSummary {
                id: format!("img-{reference}"),
                repo_tags: vec![reference.clone()],
            })
            .collect())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.images.remove(reference) {
            return Err(EngineError::NoSuchImage {
                reference: reference.to_string(),
            });
        }
        state.removed_images.push(reference.to_string());
        Ok(())
    }

    async fn container_logs(&self, _id: &str) -> Result<String, EngineError> {
        Ok(String::new())
    }
}

/// Registration-store double recording every put.
#[derive(Default)]
pub struct MockStore {
    pub puts: Mutex<Vec<(String, String, u64)>>,
}

impl MockStore {
    pub fn keys(&self) -> Vec<String> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _, _)| k.clone())
            .collect()
    }
}

#[async_trait]
impl TtlStore for MockStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RegistryError> {
        self.puts
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string(), ttl.as_secs()));
        Ok(())
    }
}
