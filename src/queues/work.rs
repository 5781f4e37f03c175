//! Async item processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). We limit the
//! number of work items that may be "in flight" at any one time, and once that
//! limit is reached, trying to submit more items will wait until one of the
//! in-flight items is completed.
//!
//! For the OCR service, a work item is one recognition pipeline run. Each run
//! spawns several heavy external processes, so the queue's concurrency limit is
//! what keeps a burst of requests from starting hundreds of `magick` and
//! `tesseract` processes at once.
//!
//! Callers that must not wait (HTTP handlers) never submit directly. They hand
//! the submission to a background task, which absorbs the backpressure.

use std::sync::Arc;

use futures::{
    SinkExt as _, StreamExt,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, JoinWorker},
    prelude::*,
};

/// Work items are processed by a [`WorkQueue`]. They contain an input, and a
/// one-shot channel on which to return the result.
#[derive(Debug)]
pub struct WorkItem<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    /// The input to the work item.
    pub input: Input,

    /// The one-shot channel on which to return the result.
    pub tx: oneshot::Sender<Result<Output>>,
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Result<Output>> + Send + Sync + 'static>;

/// A handle to a [`WorkQueue`].
///
/// This is basically just a wrapper around a [`mpsc::Sender`]. It can be
/// cloned cheaply and passed around.
pub struct WorkQueueHandle<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    /// Our sender.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkQueueHandle<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Submit an input and return a channel that will receive the output.
    ///
    /// This waits only if our processing capacity has been maxed out.
    pub async fn submit(&self, input: Input) -> Result<oneshot::Receiver<Result<Output>>> {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem { input, tx };
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut sender = self.tx.clone();
        sender
            .send(item)
            .await
            .context("failed to send work item")?;
        Ok(rx)
    }

    /// Submit an input and wait for the output.
    #[cfg(test)]
    pub async fn process_blocking(&self, input: Input) -> Result<Output> {
        let rx = self.submit(input).await?;
        rx.await.context("failed to receive work item result")?
    }
}

/// A queue of work items processed in parallel by a single background task.
///
/// We maintain backpressure by limiting the number of work items queued, and
/// the number currently being processed.
pub struct WorkQueue<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    /// Queue for submitting work items.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// Note that up to `concurrency_limit` items may be waiting at any one
    /// time, and another `concurrency_limit` items may be in progress.
    ///
    /// The returned [`JoinWorker`] completes once every handle (and the queue
    /// itself) has been dropped and all accepted items have finished.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<Input, Output>,
    ) -> (Self, JoinWorker) {
        let concurrency_limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let result = work_fn(item.input).await;
                    if item.tx.send(result).is_err() {
                        debug!("failed to send work item result because receiver was dropped");
                    }
                }
            })
            .await;
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// Get a handle for submitting items to the work queue.
    pub fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}
