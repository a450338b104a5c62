//! Capability and role loading
//!
//! `list_due` returns bare descriptors. Before a device is enqueued the
//! loader attaches its capability set and role assignments. A load failure
//! is logged and the device is enqueued anyway; adapter selection then falls
//! back to whatever the registry can handle without capabilities.

use std::sync::Arc;

use tracing::{instrument, trace, warn};

use crate::device::Device;
use crate::storage::DeviceRepository;

#[derive(Clone)]
pub struct CapabilityLoader {
    repo: Arc<dyn DeviceRepository>,
}

impl CapabilityLoader {
    pub fn new(repo: Arc<dyn DeviceRepository>) -> Self {
        Self { repo }
    }

    #[instrument(skip_all, fields(device = %device.name))]
    pub async fn load(&self, mut device: Device) -> Device {
        match self.repo.load_capabilities(device.id).await {
            Ok(capabilities) => device.capabilities = capabilities,
            Err(e) => warn!("failed to load capabilities: {e}"),
        }

        match self.repo.load_roles(device.id).await {
            Ok(mut roles) => {
                roles.sort_by_key(|role| role.priority);
                device.roles = roles;
            }
            Err(e) => warn!("failed to load roles: {e}"),
        }

        trace!(
            "loaded {} methods and {} roles",
            device.method_order().len(),
            device.roles.len()
        );
        device
    }
}
