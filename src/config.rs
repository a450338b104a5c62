use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, trace};

use crate::device::Device;
use crate::util;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./ispmon.db")
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub poller: PollerConfig,

    /// Storage configuration; when omitted the in-memory backend is used
    pub storage: Option<StorageConfig>,

    /// Devices upserted into storage at startup
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl Config {
    /// Seeded devices whose polling interval is not longer than the tick,
    /// which therefore get polled less often than configured
    pub fn devices_outpacing_tick(&self) -> impl Iterator<Item = &Device> {
        let tick = self.poller.tick_interval().as_secs();
        self.devices
            .iter()
            .filter(move |device| u64::from(device.polling_interval_secs) <= tick)
    }
}

/// Polling engine tuning, immutable once the engine is spawned
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Number of worker tasks (W)
    pub worker_count: usize,

    /// Admission limit on polls in flight (L)
    pub concurrent_polls: usize,

    pub tick_interval_secs: u64,

    /// Per-operation adapter timeout
    pub timeout_secs: u64,

    /// Retries of a timed-out SNMP request
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,

    /// Consecutive failures after which a device is reported as failing
    pub failure_threshold: u32,

    /// Result queue capacity, defaults to `concurrent_polls`
    pub result_queue_capacity: Option<usize>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            concurrent_polls: 50,
            tick_interval_secs: 30,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_ms: 500,
            failure_threshold: 3,
            result_queue_capacity: None,
        }
    }
}

impl PollerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn result_queue_capacity(&self) -> usize {
        self.result_queue_capacity
            .unwrap_or(self.concurrent_polls)
            .max(1)
    }

    /// Override values from `POLLER_*` environment variables
    pub fn apply_env(&mut self) {
        if let Some(workers) = util::get_worker_count() {
            self.worker_count = workers;
        }
        if let Some(concurrent) = util::get_concurrent_polls() {
            self.concurrent_polls = concurrent;
        }
        if let Some(tick) = util::get_tick_interval() {
            self.tick_interval_secs = tick;
        }
        if let Some(timeout) = util::get_timeout() {
            self.timeout_secs = timeout;
        }
        if let Some(retries) = util::get_retry_attempts() {
            self.retry_attempts = retries;
        }
        debug!("effective poller config: {self:?}");
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
