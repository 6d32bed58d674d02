//! Per-device serialized execution.
//!
//! Each device owns exactly one worker: a spawned task draining an unbounded
//! job queue. A job is a blocking read/compute closure plus a completion
//! closure (the persistence commit); both run back-to-back on a blocking
//! thread, and the queue is drained one job at a time, so no two cycles on
//! the same device ever overlap. Cycles for different devices run on
//! independent workers and proceed fully in parallel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::device::{ComputeError, Reading, Snapshot, UpdateError};

/// Blocking read/compute step of a cycle
pub type WorkFn = Box<dyn FnOnce() -> Result<Vec<Reading>, UpdateError> + Send + 'static>;

/// Completion step: receives the readings, commits them, returns the
/// published snapshot. Not invoked when the work step fails.
pub type CompleteFn =
    Box<dyn FnOnce(Vec<Reading>) -> Result<Arc<Snapshot>, UpdateError> + Send + 'static>;

struct Job {
    work: WorkFn,
    on_done: CompleteFn,
    reply: oneshot::Sender<Result<Arc<Snapshot>, UpdateError>>,
}

/// Handle to a queued cycle. Awaiting it is the synchronous mode: the caller
/// blocks until both the read and the commit have finished. Dropping it
/// leaves the cycle running to completion; failures are still logged by the
/// worker.
pub struct JobHandle {
    rx: oneshot::Receiver<Result<Arc<Snapshot>, UpdateError>>,
}

impl JobHandle {
    pub async fn wait(self) -> Result<Arc<Snapshot>, UpdateError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(UpdateError::WorkerClosed),
        }
    }
}

/// Single-cycle-at-a-time job queue for one device.
pub struct Worker {
    tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawns the worker task. Must be called from within a Tokio runtime.
    pub fn spawn(device: impl Into<String>) -> Self {
        let device = device.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Job {
                    work,
                    on_done,
                    reply,
                } = job;

                // Read and commit run back-to-back off the async threads;
                // awaiting here is what serializes cycles on this device.
                let joined = tokio::task::spawn_blocking(move || {
                    let readings = work()?;
                    on_done(readings)
                })
                .await;

                let outcome = match joined {
                    Ok(result) => result,
                    Err(e) => Err(UpdateError::Compute(ComputeError::new(format!(
                        "cycle panicked: {}",
                        e
                    )))),
                };

                if let Err(e) = &outcome {
                    error!(device = %device, error = %e, "update cycle failed");
                }

                // Fire-and-forget callers drop their handle; that is fine.
                let _ = reply.send(outcome);
            }
            debug!(device = %device, "worker drained and stopped");
        });

        Self { tx, handle }
    }

    /// Queues a cycle and returns immediately with its handle.
    pub fn submit(&self, work: WorkFn, on_done: CompleteFn) -> Result<JobHandle, UpdateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                work,
                on_done,
                reply: reply_tx,
            })
            .map_err(|_| UpdateError::WorkerClosed)?;
        Ok(JobHandle { rx: reply_rx })
    }

    /// Synchronous mode: queues a cycle and waits for its full outcome.
    pub async fn submit_wait(
        &self,
        work: WorkFn,
        on_done: CompleteFn,
    ) -> Result<Arc<Snapshot>, UpdateError> {
        self.submit(work, on_done)?.wait().await
    }

    /// Closes the queue, lets already-queued cycles finish, and joins the
    /// task. Dropping a worker without calling this detaches the task, which
    /// still drains its queue and exits on its own.
    pub async fn close(self) {
        let Worker { tx, handle } = self;
        drop(tx);
        let _ = handle.await;
    }
}
