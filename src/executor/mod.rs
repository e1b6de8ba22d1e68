//! Priority job executors for background I/O.
//!
//! - [`queue`]: The `(priority, seq)`-ordered queue shared by workers
//! - [`pq`]: Async and blocking-pool executor flavors
//!
//! Lower priority values are served first. A failing or panicking job only
//! fails its own [`JobHandle`]; workers keep going.

mod queue;
pub mod pq;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;

pub use pq::{AsyncPqExecutor, AsyncPqThreadPoolExecutor};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Executor is shut down")]
    Closed,

    #[error("Job dropped before completion")]
    Cancelled,
}

/// Resolves to the job's result once a worker has run it.
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, JobError>>) -> Self {
        Self { rx }
    }

    pub(crate) fn closed() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(JobError::Closed));
        Self { rx }
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(JobError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
