//! # Serialized facade over the container engine.
//!
//! Every engine call in the daemon goes through [`EngineClient`], which
//! funnels calls into a single FIFO lane (a one-permit semaphore). The
//! underlying engine client is not safe to hammer with concurrent
//! inspect/create calls during rollouts; serialization also makes failure
//! diagnosis deterministic.
//!
//! ## Rules
//! - The lane preserves submission order; calls never reorder across
//!   submitters (the semaphore queues waiters fairly).
//! - At most one engine call is in flight at any moment.
//! - Error normalization ("not found" → gone family) is the
//!   implementation's job; this facade only sequences.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::engine::api::{Engine, ProgressStream};
use crate::engine::models::{
    ContainerInspect, ContainerSummary, CreateContainerOptions, CreateImageOptions, ImageInspect,
    ImageSummary, StartContainerOptions,
};
use crate::error::EngineError;

/// FIFO facade over an [`Engine`] implementation.
pub struct EngineClient {
    inner: Arc<dyn Engine>,
    lane: Semaphore,
}

impl EngineClient {
    /// Wraps an engine behind the serialized lane.
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self {
            inner,
            lane: Semaphore::new(1),
        }
    }

    /// Acquires the lane; the semaphore is never closed.
    async fn slot(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.lane
            .acquire()
            .await
            .expect("engine lane semaphore is never closed")
    }

    /// Inspects a container by id or name.
    pub async fn inspect_container(
        &self,
        id_or_name: &str,
    ) -> Result<ContainerInspect, EngineError> {
        let _slot = self.slot().await;
        self.inner.inspect_container(id_or_name).await
    }

    /// Creates a container and returns its id.
    pub async fn create_container(
        &self,
        opts: &CreateContainerOptions,
    ) -> Result<String, EngineError> {
        let _slot = self.slot().await;
        self.inner.create_container(opts).await
    }

    /// Starts a created container.
    pub async fn start_container(
        &self,
        id: &str,
        opts: &StartContainerOptions,
    ) -> Result<(), EngineError> {
        let _slot = self.slot().await;
        self.inner.start_container(id, opts).await
    }

    /// Stops a running container.
    pub async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let _slot = self.slot().await;
        self.inner.stop_container(id).await
    }

    /// Removes a stopped container.
    pub async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let _slot = self.slot().await;
        self.inner.remove_container(id).await
    }

    /// Lists containers; `all` includes stopped ones.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let _slot = self.slot().await;
        self.inner.list_containers(all).await
    }

    /// Inspects a local image by reference.
    pub async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, EngineError> {
        let _slot = self.slot().await;
        self.inner.inspect_image(reference).await
    }

    /// Starts pulling an image, returning the progress stream.
    ///
    /// The lane is released once the stream is handed over; progress
    /// consumption happens outside the lane so a slow pull does not starve
    /// inspects.
    pub async fn create_image(
        &self,
        opts: &CreateImageOptions,
    ) -> Result<ProgressStream, EngineError> {
        let _slot = self.slot().await;
        self.inner.create_image(opts).await
    }

    /// Lists local images.
    pub async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let _slot = self.slot().await;
        self.inner.list_images().await
    }

    /// Removes a local image by reference.
    pub async fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        let _slot = self.slot().await;
        self.inner.remove_image(reference).await
    }

    /// Returns a tail of the container's combined stdout/stderr.
    pub async fn container_logs(&self, id: &str) -> Result<String, EngineError> {
        let _slot = self.slot().await;
        self.inner.container_logs(id).await
    }
}
