//! Set of device IDs with an outstanding poll
//!
//! The scheduler inserts on admission, the result processor removes after a
//! result has been written. A device is never admitted twice while its ID is
//! in the set, so at most one poll per device is in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct InFlight {
    devices: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a device, returning `false` if it is already in flight
    pub fn try_admit(&self, device_id: Uuid) -> bool {
        self.lock().insert(device_id)
    }

    pub fn release(&self, device_id: Uuid) -> bool {
        self.lock().remove(&device_id)
    }

    pub fn contains(&self, device_id: Uuid) -> bool {
        self.lock().contains(&device_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
