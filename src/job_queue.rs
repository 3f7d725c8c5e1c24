use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchTask {
    Dispatch { job_id: Uuid },
}

#[derive(Debug, Error)]
#[error("dispatch queue is closed")]
pub struct QueueClosed;

/// key: dispatch-queue -> hand-off between submission and provider calls
#[derive(Clone)]
pub struct DispatchQueue {
    tx: Sender<DispatchTask>,
}

impl DispatchQueue {
    /// A queue plus the receiving end, for callers that drive the worker
    /// themselves.
    pub fn channel(capacity: usize) -> (Self, Receiver<DispatchTask>) {
        let (tx, rx) = channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn enqueue(&self, job_id: Uuid) -> Result<(), QueueClosed> {
        self.tx
            .send(DispatchTask::Dispatch { job_id })
            .await
            .map_err(|_| QueueClosed)
    }
}

/// Spawn the dispatch worker. Pending jobs that never reached the provider
/// (e.g. across a restart) are queued again on startup.
pub fn start_dispatch_worker(store: Arc<dyn Store>, dispatcher: Arc<Dispatcher>) -> DispatchQueue {
    let (queue, rx) = DispatchQueue::channel(64);

    let replay = queue.clone();
    tokio::spawn(async move {
        match store.undispatched_jobs().await {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    tracing::info!(count = jobs.len(), "replaying undispatched generation jobs");
                }
                for job in jobs {
                    if replay.enqueue(job.id).await.is_err() {
                        break;
                    }
                }
            }
            Err(err) => tracing::warn!(?err, "failed to load undispatched jobs"),
        }
    });

    run_worker(rx, dispatcher);
    queue
}

pub fn run_worker(mut rx: Receiver<DispatchTask>, dispatcher: Arc<Dispatcher>) {
    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            match task {
                DispatchTask::Dispatch { job_id } => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.dispatch(job_id).await;
                    });
                }
            }
        }
    });
}
