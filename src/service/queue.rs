//! # Serialized per-service work queue.
//!
//! Every mutating rollout step of a service (launch, stop, start replicas,
//! retire old generations, reactions to container and dependency events)
//! runs as a job on its service's [`WorkQueue`]. The queue is FIFO with
//! concurrency 1, so no two rollout steps of the same service ever
//! interleave; the queue replaces locks.
//!
//! ## Rules
//! - Jobs execute in submission order, one at a time.
//! - A running job is never preempted; cancellation stops the queue
//!   between jobs.
//! - After cancellation, pending and future submissions are dropped
//!   ([`WorkQueue::submit`] resolves to `None`).

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// FIFO, single-worker job queue.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl WorkQueue {
    /// Creates the queue and spawns its worker.
    ///
    /// The worker drains jobs until `token` is cancelled or every sender is
    /// dropped.
    pub fn new(token: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job.await,
                        None => break,
                    },
                }
            }
        });
        Self { tx }
    }

    /// Enqueues a fire-and-forget job.
    pub fn push(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let _ = self.tx.send(Box::pin(fut));
    }

    /// Enqueues a job and waits for its result.
    ///
    /// Returns `None` when the queue was shut down before the job ran.
    pub async fn submit<T, F>(&self, fut: F) -> Option<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.push(async move {
            let _ = done_tx.send(fut.await);
        });
        done_rx.await.ok()
    }
}
