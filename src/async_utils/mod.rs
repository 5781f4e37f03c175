//! Asynchronous utilities for use with Tokio.
//!
//! The job service spends nearly all of its time waiting on external
//! processes and remote stores, so the pieces here are about handing work to
//! background tasks and being able to wait for those tasks again at shutdown.

use std::pin::Pin;

use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Spawn a detached background task, logging (rather than propagating) any
/// error it returns.
///
/// Request handlers use this for work that must outlive the request, such as
/// feeding pages into the worker pool or watching a job for completion.
pub fn spawn_logged<Fut>(task_name: &'static str, fut: Fut)
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = fut.await {
            error!(task = task_name, "background task failed: {:?}", err);
        }
    });
}
