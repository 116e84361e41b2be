//! # Docker Engine API client over HTTP.
//!
//! Production [`Engine`] implementation speaking the Docker Engine REST API
//! against `DOCKER_HOST` (a `tcp://` or `http://` address; the daemon does
//! not speak the unix socket transport). Responsibilities:
//!
//! - map transport/HTTP failures into [`EngineError`], normalizing 404 into
//!   the gone family,
//! - stream image pull progress as parsed JSON lines,
//! - demultiplex the engine's log framing for the one-shot log tail.
//!
//! Serialization of calls is NOT handled here; that is
//! [`EngineClient`](crate::engine::EngineClient)'s job.

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};

use async_trait::async_trait;

use crate::engine::api::{Engine, ProgressStream};
use crate::engine::models::{
    ContainerInspect, ContainerSummary, CreateContainerOptions, CreateImageOptions, ImageInspect,
    ImageSummary, PullProgress, StartContainerOptions,
};
use crate::error::EngineError;

/// Default engine address when `DOCKER_HOST` is unset.
const DEFAULT_HOST: &str = "http://127.0.0.1:2375";

/// Connect timeout for engine requests.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Log lines fetched for the one-shot tail.
const LOG_TAIL_LINES: u32 = 100;

/// Docker Engine API client.
pub struct HttpEngine {
    client: Client,
    base: String,
}

impl HttpEngine {
    /// Creates a client for the given base address (`http://host:port`).
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    pub fn new(base: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("kiruna/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            base: normalize_host(&base.into()),
        }
    }

    /// Creates a client from `DOCKER_HOST`, falling back to
    /// `http://127.0.0.1:2375`.
    pub fn from_env() -> Self {
        let host = std::env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        Self::new(host)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Normalizes a response, mapping 404 through `gone` and other
    /// non-success statuses into [`EngineError::Api`]. 304 counts as
    /// success (stop of an already-stopped container).
    async fn check(
        resp: Response,
        gone: impl FnOnce() -> EngineError,
    ) -> Result<Response, EngineError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(gone());
        }
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(EngineError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Accepts `tcp://` and bare `host:port` forms for `DOCKER_HOST`.
fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        format!("http://{rest}")
    } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[async_trait]
impl Engine for HttpEngine {
    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerInspect, EngineError> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{id_or_name}/json")))
            .send()
            .await?;
        let name = id_or_name.to_string();
        let resp = Self::check(resp, || EngineError::NoSuchContainer { name }).await?;
        Ok(resp.json().await?)
    }

    async fn create_container(&self, opts: &CreateContainerOptions) -> Result<String, EngineError> {
        let resp = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", opts.name.as_str())])
            .json(opts)
            .send()
            .await?;
        let resp = Self::check(resp, || EngineError::NoSuchImage {
            reference: opts.image.clone(),
        })
        .await?;

        #[derive(serde::Deserialize)]
        struct Created {
            #[serde(rename = "Id")]
            id: String,
        }
        let created: Created = resp.json().await?;
        Ok(created.id)
    }

    async fn start_container(
        &self,
        id: &str,
        opts: &StartContainerOptions,
    ) -> Result<(), EngineError> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{id}/start")))
            .json(opts)
            .send()
            .await?;
        let name = id.to_string();
        Self::check(resp, || EngineError::NoSuchContainer { name }).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{id}/stop")))
            .send()
            .await?;
        let name = id.to_string();
        Self::check(resp, || EngineError::NoSuchContainer { name }).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let resp = self
            .client
            .delete(self.url(&format!("/containers/{id}")))
            .send()
            .await?;
        let name = id.to_string();
        Self::check(resp, || EngineError::NoSuchContainer { name }).await?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let resp = self
            .client
            .get(self.url("/containers/json"))
            .query(&[("all", if all { "true" } else { "false" })])
            .send()
            .await?;
        let resp = Self::check(resp, || EngineError::Api {
            status: 404,
            message: "container listing unavailable".into(),
        })
        .await?;
        Ok(resp.json().await?)
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, EngineError> {
        let resp = self
            .client
            .get(self.url(&format!("/images/{reference}/json")))
            .send()
            .await?;
        let r = reference.to_string();
        let resp = Self::check(resp, || EngineError::NoSuchImage { reference: r }).await?;
        Ok(resp.json().await?)
    }

    async fn create_image(&self, opts: &CreateImageOptions) -> Result<ProgressStream, EngineError> {
        let mut query = vec![
            ("fromImage", opts.from_image.clone()),
            ("tag", opts.tag.clone()),
        ];
        if let Some(registry) = &opts.registry {
            query.push(("registry", registry.clone()));
        }
        let resp = self
            .client
            .post(self.url("/images/create"))
            .query(&query)
            .send()
            .await?;
        let reference = format!("{}:{}", opts.from_image, opts.tag);
        let gone_ref = reference.clone();
        let resp = Self::check(resp, || EngineError::NoSuchImage {
            reference: gone_ref,
        })
        .await?;

        // Progress arrives as newline-delimited JSON; chunks may split
        // lines, so carry a remainder buffer across chunks.
        struct PullState {
            inner: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
            buf: String,
            pending: VecDeque<Result<PullProgress, EngineError>>,
            reference: String,
            done: bool,
        }

        fn drain_lines(state: &mut PullState, flush: bool) {
            loop {
                let line = match state.buf.find('\n') {
                    Some(pos) => {
                        let line = state.buf[..pos].trim().to_string();
                        state.buf.drain(..=pos);
                        line
                    }
                    None if flush && !state.buf.trim().is_empty() => {
                        std::mem::take(&mut state.buf).trim().to_string()
                    }
                    None => break,
                };
                if line.is_empty() {
                    continue;
                }
                let item = match serde_json::from_str::<PullProgress>(&line) {
                    Ok(progress) => match &progress.error {
                        Some(reason) => Err(EngineError::PullFailed {
                            reference: state.reference.clone(),
                            reason: reason.clone(),
                        }),
                        None => Ok(progress),
                    },
                    Err(_) => Ok(PullProgress {
                        status: Some(line),
                        error: None,
                    }),
                };
                state.pending.push_back(item);
            }
        }

        let state = PullState {
            inner: resp.bytes_stream().boxed(),
            buf: String::new(),
            pending: VecDeque::new(),
            reference,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.inner.next().await {
                    Some(Ok(chunk)) => {
                        state.buf.push_str(&String::from_utf8_lossy(&chunk));
                        drain_lines(&mut state, false);
                    }
                    Some(Err(e)) => {
                        state.pending.push_back(Err(EngineError::Transport(e)));
                        state.done = true;
                    }
                    None => {
                        drain_lines(&mut state, true);
                        state.done = true;
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let resp = self.client.get(self.url("/images/json")).send().await?;
        let resp = Self::check(resp, || EngineError::Api {
            status: 404,
            message: "image listing unavailable".into(),
        })
        .await?;
        Ok(resp.json().await?)
    }

    async fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        let resp = self
            .client
            .delete(self.url(&format!("/images/{reference}")))
            .send()
            .await?;
        let r = reference.to_string();
        Self::check(resp, || EngineError::NoSuchImage { reference: r }).await?;
        Ok(())
    }

    async fn container_logs(&self, id: &str) -> Result<String, EngineError> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{id}/logs")))
            .query(&[
                ("stdout", "true".to_string()),
                ("stderr", "true".to_string()),
                ("tail", LOG_TAIL_LINES.to_string()),
            ])
            .send()
            .await?;
        let name = id.to_string();
        let resp = Self::check(resp, || EngineError::NoSuchContainer { name }).await?;
        let raw = resp.bytes().await?;
        Ok(demux_log_stream(&raw))
    }
}

/// Strips the engine's 8-byte stream-multiplexing headers. Containers
/// attached to a TTY produce raw output; anything that does not look like a
/// framed stream is passed through as-is.
fn demux_log_stream(raw: &[u8]) -> String {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 8 <= raw.len() {
        let kind = raw[i];
        if kind > 2 || raw[i + 1] != 0 || raw[i + 2] != 0 || raw[i + 3] != 0 {
            return String::from_utf8_lossy(raw).into_owned();
        }
        let size = u32::from_be_bytes([raw[i + 4], raw[i + 5], raw[i + 6], raw[i + 7]]) as usize;
        let start = i + 8;
        let end = (start + size).min(raw.len());
        out.extend_from_slice(&raw[start..end]);
        i = end;
    }
    if i < raw.len() {
        out.extend_from_slice(&raw[i..]);
    }
    String::from_utf8_lossy(&out).into_owned()
}
