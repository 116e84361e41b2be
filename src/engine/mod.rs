//! Container engine access: API models, the [`Engine`] contract, the
//! serialized [`EngineClient`] facade, and a Docker Engine API
//! implementation over HTTP.

mod api;
mod client;
mod http;
mod models;

pub use api::{Engine, ProgressStream};
pub use client::EngineClient;
pub use http::HttpEngine;
pub use models::{
    ContainerInspect, ContainerState, ContainerSummary, CreateContainerOptions,
    CreateImageOptions, ImageInspect, ImageSummary, NetworkSettings, PortBinding, PullProgress,
    StartContainerOptions,
};
