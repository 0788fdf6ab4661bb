//! Serialized operation queue.
//!
//! Pause and resume calls against one producer or consumer are applied in
//! the order they were enqueued: each resource gets a lane drained by its own
//! task, and the next operation starts only after the previous engine call
//! completed. Lanes of different resources never block each other. A lane's
//! task retires once its queue is empty.

use crate::errors::SfuError;
use crate::observability::metrics;
use crate::types::{ConsumerId, ProducerId};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

/// Resource an operation is serialized against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueuedResource {
    Producer(ProducerId),
    Consumer(ConsumerId),
}

impl QueuedResource {
    fn label(self) -> &'static str {
        match self {
            QueuedResource::Producer(_) => "producer",
            QueuedResource::Consumer(_) => "consumer",
        }
    }
}

impl fmt::Display for QueuedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueuedResource::Producer(id) => write!(f, "producer:{id}"),
            QueuedResource::Consumer(id) => write!(f, "consumer:{id}"),
        }
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

type Lanes = Arc<Mutex<HashMap<QueuedResource, mpsc::UnboundedSender<Job>>>>;

/// Result of an enqueued operation.
#[derive(Debug)]
pub struct PendingOperation {
    rx: oneshot::Receiver<Result<(), SfuError>>,
}

impl PendingOperation {
    /// Wait until the operation has been applied.
    pub async fn applied(self) -> Result<(), SfuError> {
        self.rx
            .await
            .map_err(|e| SfuError::Internal(format!("queued operation dropped: {e}")))?
    }
}

/// Per-resource FIFO of mutating operations.
#[derive(Default)]
pub struct OperationQueue {
    lanes: Lanes,
}

impl OperationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `operation` to the resource's lane.
    ///
    /// The operation is ordered relative to earlier `enqueue` calls for the
    /// same resource as soon as this returns.
    pub async fn enqueue<F>(&self, resource: QueuedResource, operation: F) -> PendingOperation
    where
        F: Future<Output = Result<(), SfuError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let enqueued_at = Instant::now();
        let job: Job = Box::pin(async move {
            let result = operation.await;
            metrics::record_queue_operation(resource.label(), enqueued_at.elapsed());
            let _ = tx.send(result);
        });

        let mut lanes = self.lanes.lock().await;
        let job = match lanes.get(&resource) {
            Some(lane) => match lane.send(job) {
                Ok(()) => {
                    trace!(target: "sfu.queue", resource = %resource, "Operation queued behind lane");
                    return PendingOperation { rx };
                }
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        // The receiver is alive until the drain task retires.
        let _ = lane_tx.send(job);
        lanes.insert(resource, lane_tx);
        tokio::spawn(drain_lane(Arc::clone(&self.lanes), resource, lane_rx));

        PendingOperation { rx }
    }

    /// Number of resources with queued or running operations.
    pub async fn active_lanes(&self) -> usize {
        self.lanes.lock().await.len()
    }
}

async fn drain_lane(lanes: Lanes, resource: QueuedResource, mut rx: mpsc::UnboundedReceiver<Job>) {
    debug!(target: "sfu.queue", resource = %resource, "Lane started");
    loop {
        while let Ok(job) = rx.try_recv() {
            job.await;
        }

        // Enqueue sends while holding the lanes lock, so an empty check under
        // the same lock cannot miss a job.
        let mut guard = lanes.lock().await;
        match rx.try_recv() {
            Ok(job) => {
                drop(guard);
                job.await;
            }
            Err(_) => {
                guard.remove(&resource);
                debug!(target: "sfu.queue", resource = %resource, "Lane retired");
                return;
            }
        }
    }
}
