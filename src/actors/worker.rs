//! WorkerPool - Fixed set of tasks executing polls
//!
//! All workers share one work receiver. Each dequeued job is polled through
//! the registry's fallback chain and the outcome is forwarded to the result
//! queue with a blocking send, so a slow processor backpressures the workers
//! (and through the full work queue, the scheduler).
//!
//! Every poll runs in its own task. A panicking adapter only takes that task
//! down; the worker turns the `JoinError` into a failure result.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use super::messages::PollJob;
use crate::adapters::AdapterRegistry;
use crate::device::Device;
use crate::error::PollError;
use crate::poll_result::PollResult;

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers
    ///
    /// Workers exit once the work queue is closed and drained. Jobs still
    /// queued after `cancel` fires are dropped without polling.
    pub fn spawn(
        count: usize,
        registry: Arc<AdapterRegistry>,
        work_rx: mpsc::Receiver<PollJob>,
        result_tx: mpsc::Sender<PollResult>,
        cancel: CancellationToken,
    ) -> Self {
        let work_rx = Arc::new(Mutex::new(work_rx));

        let workers = (0..count.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    registry: registry.clone(),
                    work_rx: work_rx.clone(),
                    result_tx: result_tx.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for outcome in join_all(self.workers).await {
            if let Err(e) = outcome {
                error!("worker task failed: {e}");
            }
        }
        debug!("all workers stopped");
    }
}

struct Worker {
    id: usize,
    registry: Arc<AdapterRegistry>,
    work_rx: Arc<Mutex<mpsc::Receiver<PollJob>>>,
    result_tx: mpsc::Sender<PollResult>,
    cancel: CancellationToken,
}

impl Worker {
    #[instrument(skip(self), fields(worker = self.id))]
    async fn run(self) {
        trace!("worker started");

        loop {
            let job = { self.work_rx.lock().await.recv().await };
            let Some(job) = job else {
                break;
            };

            if self.cancel.is_cancelled() {
                debug!("shutting down, dropping queued poll of {}", job.device.name);
                continue;
            }

            trace!(
                "polling {} (queued {}ms)",
                job.device.name,
                (Utc::now() - job.admitted_at).num_milliseconds()
            );

            let result = self.poll(job.device).await;
            if self.result_tx.send(result).await.is_err() {
                warn!("result queue closed, stopping worker");
                break;
            }
        }

        trace!("worker stopped");
    }

    async fn poll(&self, device: Device) -> PollResult {
        let started_at = Utc::now();

        let task = {
            let registry = self.registry.clone();
            let cancel = self.cancel.clone();
            let device = device.clone();
            tokio::spawn(async move { registry.poll_with_fallback(&cancel, &device).await })
        };

        let message = match task.await {
            Ok(Ok(result)) => return result,
            Ok(Err(PollError::Cancelled)) => {
                debug!("poll of {} cancelled", device.name);
                let mut result = PollResult::failed(&device, PollError::Cancelled.to_string());
                result.started_at = started_at;
                result.cancelled = true;
                result.finish();
                return result;
            }
            Ok(Err(e)) if e.is_configuration() => {
                warn!("{} cannot be polled: {e}", device.name);
                e.to_string()
            }
            Ok(Err(e)) => {
                debug!("poll of {} failed: {e}", device.name);
                e.to_string()
            }
            Err(e) if e.is_panic() => {
                error!("adapter panicked while polling {}", device.name);
                "adapter panicked during poll".to_string()
            }
            Err(e) => {
                error!("poll task of {} failed: {e}", device.name);
                format!("poll task failed: {e}")
            }
        };

        let mut result = PollResult::failed(&device, message);
        result.started_at = started_at;
        result.finish();
        result
    }
}
