//! ResultProcessorActor - Persists poll results
//!
//! Single consumer of the result queue, so results of one device are applied
//! in the order they were produced. For each result:
//!
//! 1. Append a history record (always)
//! 2. On success: advance `last_polled_at`, write the system metrics point,
//!    upsert role sessions/leases
//! 3. On failure: leave `last_polled_at` alone and count the failure
//! 4. Release the device from the in-flight set
//!
//! Storage errors are logged and counted, never fatal. The actor runs until
//! every result sender is gone and the queue is drained.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};

use super::inflight::InFlight;
use super::messages::ProcessorStats;
use crate::poll_result::PollResult;
use crate::storage::{DeviceRepository, HistoryRecord, MetricsStore, StorageResult};

pub struct ResultProcessorActor {
    result_rx: mpsc::Receiver<PollResult>,
    repo: Arc<dyn DeviceRepository>,
    store: Arc<dyn MetricsStore>,
    in_flight: InFlight,

    /// Consecutive failures at which a device is reported
    failure_threshold: u32,

    stats: ProcessorStats,
}

impl ResultProcessorActor {
    pub fn new(
        result_rx: mpsc::Receiver<PollResult>,
        repo: Arc<dyn DeviceRepository>,
        store: Arc<dyn MetricsStore>,
        in_flight: InFlight,
        failure_threshold: u32,
    ) -> Self {
        Self {
            result_rx,
            repo,
            store,
            in_flight,
            failure_threshold: failure_threshold.max(1),
            stats: ProcessorStats::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<ProcessorStats> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), name = "processor")]
    pub async fn run(mut self) -> ProcessorStats {
        debug!("starting result processor");

        while let Some(result) = self.result_rx.recv().await {
            self.process(result).await;
        }

        debug!("result queue closed, processor stopped: {:?}", self.stats);
        self.stats
    }

    async fn process(&mut self, result: PollResult) {
        let device_id = result.device_id;
        self.stats.processed += 1;

        let history = self.store.write_history(HistoryRecord::from(&result)).await;
        self.check(history, "write polling history");

        if result.success {
            self.stats.succeeded += 1;
            self.apply_success(&result).await;
        } else {
            self.stats.failed += 1;
            self.apply_failure(&result).await;
        }

        self.in_flight.release(device_id);
    }

    async fn apply_success(&mut self, result: &PollResult) {
        trace!(
            "{} succeeded via {} in {}ms",
            result.device_id, result.adapter, result.response_time_ms
        );

        // the interval is measured from when the poll began
        let marked = self.repo.mark_polled(result.device_id, result.started_at).await;
        self.check(marked, "mark device polled");

        let written = self
            .store
            .write_system_metrics(result.tenant_id, result.device_id, result.completed_at, result)
            .await;
        self.check(written, "write system metrics");

        for batch in result.session_batches() {
            let kind = batch.kind();
            match self
                .store
                .upsert_sessions(result.tenant_id, result.device_id, batch)
                .await
            {
                Ok(count) => trace!("upserted {count} {kind} entities"),
                Err(e) => {
                    self.stats.storage_errors += 1;
                    error!("failed to upsert {kind} sessions of {}: {e}", result.device_id);
                }
            }
        }
    }

    async fn apply_failure(&mut self, result: &PollResult) {
        let reason = result.error.as_deref().unwrap_or("unknown error");
        debug!("{} failed via {}: {reason}", result.device_id, result.adapter);

        // cut short by shutdown: the failure counter stays as it was
        if result.cancelled {
            return;
        }

        match self.repo.record_failure(result.device_id).await {
            Ok(failures) if failures >= self.failure_threshold => {
                warn!(
                    "device {} failed {failures} consecutive polls, last error: {reason}",
                    result.device_id
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.stats.storage_errors += 1;
                error!("failed to record failure of {}: {e}", result.device_id);
            }
        }
    }

    fn check(&mut self, outcome: StorageResult<()>, what: &str) {
        if let Err(e) = outcome {
            self.stats.storage_errors += 1;
            error!("failed to {what}: {e}");
        }
    }
}
