//! SchedulerActor - Admits due devices into the work queue
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → list_due → in-flight check → load capabilities/roles → try_send(PollJob)
//!     ↑
//!     └─── Commands (TickNow, PollNow)
//! ```
//!
//! The scheduler never blocks on the work queue. When the queue is full the
//! remaining due devices are shed and picked up again on a later tick, since
//! nothing advanced their `last_polled_at`.
//!
//! Dropping the actor (on cancellation) drops the work sender, which lets
//! the worker pool drain and exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

use super::inflight::InFlight;
use super::messages::{PollJob, SchedulerCommand};
use crate::device::Device;
use crate::loader::CapabilityLoader;
use crate::storage::DeviceRepository;

pub struct SchedulerActor {
    repo: Arc<dyn DeviceRepository>,
    loader: CapabilityLoader,
    in_flight: InFlight,

    work_tx: mpsc::Sender<PollJob>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    cancel: CancellationToken,

    tick_interval: Duration,

    /// Maximum number of devices in flight at once
    admission_limit: usize,
}

impl SchedulerActor {
    pub fn new(
        repo: Arc<dyn DeviceRepository>,
        in_flight: InFlight,
        work_tx: mpsc::Sender<PollJob>,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        cancel: CancellationToken,
        tick_interval: Duration,
        admission_limit: usize,
    ) -> Self {
        Self {
            loader: CapabilityLoader::new(repo.clone()),
            repo,
            in_flight,
            work_tx,
            command_rx,
            cancel,
            tick_interval,
            admission_limit: admission_limit.max(1),
        }
    }

    /// Run the actor's main loop until the cancellation token fires
    #[instrument(skip(self), name = "scheduler")]
    pub async fn run(mut self) {
        debug!(
            "starting scheduler (tick {:?}, admission limit {})",
            self.tick_interval, self.admission_limit
        );

        // startup pass runs before any command is served
        if !self.cancel.is_cancelled()
            && let Err(e) = self.tick().await
        {
            error!("initial scheduling pass failed: {:#}", e);
        }

        let mut ticker = interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    debug!("cancellation requested");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("scheduling pass failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::TickNow { respond_to } => {
                            debug!("received TickNow command");
                            let _ = respond_to.send(self.tick().await);
                        }

                        SchedulerCommand::PollNow { device_id, respond_to } => {
                            debug!("received PollNow command for {device_id}");
                            let _ = respond_to.send(self.poll_now(device_id).await);
                        }
                    }
                }
            }
        }

        debug!("scheduler stopped, closing work queue");
    }

    /// Room left under the admission limit
    fn budget(&self) -> usize {
        self.admission_limit.saturating_sub(self.in_flight.len())
    }

    /// One scheduling pass, returning the number of admitted devices
    async fn tick(&mut self) -> Result<usize> {
        let budget = self.budget();
        if budget == 0 {
            trace!("admission limit reached, nothing to do");
            return Ok(0);
        }
        if self.work_tx.capacity() == 0 {
            debug!("work queue full, skipping pass");
            return Ok(0);
        }

        // in-flight devices are still due, ask for enough rows to skip them
        let limit = budget + self.in_flight.len();
        let due = self
            .repo
            .list_due(Utc::now(), limit)
            .await
            .context("failed to list due devices")?;

        trace!("{} due devices, budget {budget}", due.len());

        let mut admitted = 0;
        let mut shed = 0;
        for device in due {
            if admitted >= budget || self.cancel.is_cancelled() {
                break;
            }
            if shed > 0 {
                shed += 1;
                continue;
            }
            if !self.in_flight.try_admit(device.id) {
                trace!("{} still in flight, skipping", device.name);
                continue;
            }

            if self.enqueue(device).await {
                admitted += 1;
            } else {
                shed += 1;
            }
        }

        if shed > 0 {
            warn!("work queue full, shed {shed} due device(s) until a later tick");
        }
        if admitted > 0 {
            debug!("admitted {admitted} device(s)");
        }
        Ok(admitted)
    }

    async fn poll_now(&mut self, device_id: Uuid) -> Result<bool> {
        if self.budget() == 0 {
            debug!("admission limit reached, not admitting {device_id}");
            return Ok(false);
        }

        let device = self
            .repo
            .get_device(device_id)
            .await
            .context("failed to look up device")?
            .with_context(|| format!("device {device_id} not found"))?;

        if !self.in_flight.try_admit(device.id) {
            debug!("{} already in flight", device.name);
            return Ok(false);
        }

        Ok(self.enqueue(device).await)
    }

    /// Load capabilities and hand the device to the workers without waiting
    ///
    /// The device must already be claimed in the in-flight set; it is
    /// released again when the queue refuses it.
    async fn enqueue(&self, device: Device) -> bool {
        let device = self.loader.load(device).await;

        match self.work_tx.try_send(PollJob::new(device)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.in_flight.release(job.device.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!("work queue closed, dropping {}", job.device.name);
                self.in_flight.release(job.device.id);
                false
            }
        }
    }
}

/// Handle for controlling a SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn the scheduler, returning its handle and task
    ///
    /// The task ends once `cancel` fires; the work queue closes with it.
    pub fn spawn(
        repo: Arc<dyn DeviceRepository>,
        in_flight: InFlight,
        work_tx: mpsc::Sender<PollJob>,
        cancel: CancellationToken,
        tick_interval: Duration,
        admission_limit: usize,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = SchedulerActor::new(
            repo,
            in_flight,
            work_tx,
            cmd_rx,
            cancel,
            tick_interval,
            admission_limit,
        );
        let task = tokio::spawn(actor.run());

        (Self { sender: cmd_tx }, task)
    }

    /// Run a scheduling pass immediately, returning how many devices were admitted
    pub async fn tick_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TickNow { respond_to: tx })
            .await
            .context("failed to send TickNow command")?;

        rx.await.context("failed to receive response")?
    }

    /// Admit one device now, returning `false` if it could not be admitted
    pub async fn poll_now(&self, device_id: Uuid) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::PollNow {
                device_id,
                respond_to: tx,
            })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }
}
