//! Wiring of the polling pipeline
//!
//! [`PollerHandle::spawn`] creates both queues, the in-flight set and the
//! three stages. [`PollerHandle::shutdown`] cancels the token and waits for
//! the stages in order: scheduler, workers, processor.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::actors::{
    InFlight, ProcessorStats, ResultProcessorActor, SchedulerHandle, WorkerPool,
};
use crate::adapters::AdapterRegistry;
use crate::config::PollerConfig;
use crate::storage::{DeviceRepository, MetricsStore};

pub struct PollerHandle {
    scheduler: SchedulerHandle,
    in_flight: InFlight,
    cancel: CancellationToken,

    scheduler_task: JoinHandle<()>,
    workers: WorkerPool,
    processor_task: JoinHandle<ProcessorStats>,
}

impl PollerHandle {
    /// Start the pipeline; the first scheduling pass runs immediately
    #[instrument(skip_all)]
    pub fn spawn(
        config: &PollerConfig,
        registry: Arc<AdapterRegistry>,
        repo: Arc<dyn DeviceRepository>,
        store: Arc<dyn MetricsStore>,
        cancel: CancellationToken,
    ) -> Self {
        let admission_limit = config.concurrent_polls.max(1);
        let (work_tx, work_rx) = mpsc::channel(admission_limit);
        let (result_tx, result_rx) = mpsc::channel(config.result_queue_capacity());
        let in_flight = InFlight::new();

        info!(
            "starting poller: {} workers, {} concurrent polls, adapters {:?}",
            config.worker_count,
            admission_limit,
            registry.adapter_names()
        );

        let processor_task = ResultProcessorActor::new(
            result_rx,
            repo.clone(),
            store,
            in_flight.clone(),
            config.failure_threshold,
        )
        .spawn();

        // workers own every result sender from here on
        let workers = WorkerPool::spawn(
            config.worker_count,
            registry,
            work_rx,
            result_tx,
            cancel.clone(),
        );

        let (scheduler, scheduler_task) = SchedulerHandle::spawn(
            repo,
            in_flight.clone(),
            work_tx,
            cancel.clone(),
            config.tick_interval(),
            admission_limit,
        );

        Self {
            scheduler,
            in_flight,
            cancel,
            scheduler_task,
            workers,
            processor_task,
        }
    }

    pub async fn tick_now(&self) -> Result<usize> {
        self.scheduler.tick_now().await
    }

    pub async fn poll_now(&self, device_id: Uuid) -> Result<bool> {
        self.scheduler.poll_now(device_id).await
    }

    /// Number of devices with an outstanding poll
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the pipeline to stop after the token was cancelled elsewhere
    pub async fn wait(self) -> Result<ProcessorStats> {
        self.scheduler_task
            .await
            .context("scheduler task failed")?;
        self.workers.join().await;
        let stats = self
            .processor_task
            .await
            .context("result processor task failed")?;

        info!(
            "poller stopped: {} processed, {} succeeded, {} failed, {} storage errors",
            stats.processed, stats.succeeded, stats.failed, stats.storage_errors
        );
        Ok(stats)
    }

    /// Cancel the token and drain the pipeline
    pub async fn shutdown(self) -> Result<ProcessorStats> {
        info!("shutting down poller");
        self.cancel.cancel();
        self.wait().await
    }
}
