//! Polling engine for ISP routers
//!
//! Periodically collects health metrics, interface statuses and role-specific
//! session data (PPPoE, NAT, DHCP) from managed routers over SNMP or the
//! MikroTik RouterOS API, and persists the results.
//!
//! ```text
//! Scheduler → WorkerPool → ResultProcessor
//!     │            │              │
//!  DeviceRepository  AdapterRegistry  MetricsStore
//! ```
//!
//! See [`poller::PollerHandle`] for the entry point.

pub mod actors;
pub mod adapters;
pub mod config;
pub mod device;
pub mod error;
pub mod loader;
pub mod poll_result;
pub mod poller;
pub mod storage;
pub mod util;

pub use adapters::{AdapterConfig, AdapterRegistry, PollerAdapter};
pub use device::{CapabilitySet, Device, DeviceStatus, RoleAssignment};
pub use error::{PollError, SessionFailure};
pub use poll_result::{MetricValue, PollResult};
pub use poller::PollerHandle;
