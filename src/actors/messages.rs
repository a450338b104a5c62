//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Jobs**: Devices flow scheduler → workers through a bounded queue
//! 2. **Results**: Poll results flow workers → processor through a bounded queue
//! 3. **Commands**: Request/response messages sent to the scheduler via mpsc

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::device::Device;

/// A device admitted for polling, with capabilities and roles loaded
#[derive(Debug, Clone)]
pub struct PollJob {
    pub device: Device,

    /// When the scheduler admitted the device
    pub admitted_at: DateTime<Utc>,
}

impl PollJob {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            admitted_at: Utc::now(),
        }
    }
}

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run one scheduling pass now (bypassing the tick timer)
    TickNow {
        /// Number of devices admitted by the pass
        respond_to: oneshot::Sender<anyhow::Result<usize>>,
    },

    /// Admit a single device regardless of its due state
    ///
    /// Responds `false` when the device is already in flight or the work
    /// queue has no room.
    PollNow {
        device_id: Uuid,
        respond_to: oneshot::Sender<anyhow::Result<bool>>,
    },
}

/// Running totals of the result processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,

    /// Storage calls that returned an error
    pub storage_errors: u64,
}
