//! Actor-based polling pipeline
//!
//! Each actor runs as an independent async task communicating via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!   ┌──────────────┐  PollJob   ┌──────────────┐  PollResult  ┌─────────────────┐
//!   │  Scheduler   │──(bounded)─▶  WorkerPool  │──(bounded)──▶ ResultProcessor │
//!   │  (1 task)    │            │  (N tasks)   │              │  (1 task)       │
//!   └──────┬───────┘            └──────┬───────┘              └────────┬────────┘
//!          │ list_due                  │ poll_with_fallback            │ mark_polled
//!          ▼                           ▼                               ▼ history/metrics
//!    DeviceRepository           AdapterRegistry                  MetricsStore
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Queues**: bounded mpsc between stages; a full work queue sheds load,
//!    a full result queue backpressures the workers
//! 2. **Commands**: the scheduler has an mpsc command channel for control messages
//! 3. **Request/Response**: oneshot channels for synchronous queries
//! 4. **Shutdown**: one `CancellationToken`; queues close stage by stage so
//!    every computed result is persisted

pub mod inflight;
pub mod messages;
pub mod processor;
pub mod scheduler;
pub mod worker;

pub use inflight::InFlight;
pub use messages::{PollJob, ProcessorStats, SchedulerCommand};
pub use processor::ResultProcessorActor;
pub use scheduler::{SchedulerActor, SchedulerHandle};
pub use worker::WorkerPool;
