//! # The engine contract.
//!
//! [`Engine`] is the seam between the reconciler and the container engine.
//! Implementations normalize their transport's "not found" answers into
//! [`EngineError::NoSuchContainer`] / [`EngineError::NoSuchImage`] so the
//! rest of the daemon can branch on [`EngineError::is_gone`] instead of
//! status codes.
//!
//! The production implementation is [`HttpEngine`](crate::engine::HttpEngine);
//! tests substitute an in-memory double. All calls go through the
//! serialized [`EngineClient`](crate::engine::EngineClient) facade.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::engine::models::{
    ContainerInspect, ContainerSummary, CreateContainerOptions, CreateImageOptions, ImageInspect,
    ImageSummary, PullProgress, StartContainerOptions,
};
use crate::error::EngineError;

/// Stream of pull progress messages, consumed to end-of-stream by the
/// caller. Any `Err` item is fatal to the pull.
pub type ProgressStream =
    Pin<Box<dyn Stream<Item = Result<PullProgress, EngineError>> + Send + 'static>>;

/// Async contract for an opaque container engine.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Inspects a container by id or name.
    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerInspect, EngineError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, opts: &CreateContainerOptions) -> Result<String, EngineError>;

    /// Starts a created container.
    async fn start_container(
        &self,
        id: &str,
        opts: &StartContainerOptions,
    ) -> Result<(), EngineError>;

    /// Stops a running container.
    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    /// Removes a stopped container.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Lists containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Inspects a local image by reference.
    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, EngineError>;

    /// Starts pulling an image, returning the progress stream.
    async fn create_image(&self, opts: &CreateImageOptions) -> Result<ProgressStream, EngineError>;

    /// Lists local images.
    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError>;

    /// Removes a local image by reference.
    async fn remove_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Returns a tail of the container's combined stdout/stderr.
    async fn container_logs(&self, id: &str) -> Result<String, EngineError>;
}
