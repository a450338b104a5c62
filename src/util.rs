use std::str::FromStr;

const POLLER_WORKERS: &str = "POLLER_WORKERS";
const POLLER_CONCURRENT: &str = "POLLER_CONCURRENT";
const POLLER_TICK: &str = "POLLER_TICK";
const POLLER_TIMEOUT: &str = "POLLER_TIMEOUT";
const POLLER_RETRY: &str = "POLLER_RETRY";
const POLLER_INTERVAL: &str = "POLLER_INTERVAL";

const DEFAULT_INTERVAL_SECS: u32 = 300;

fn from_env<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|res| res.parse().ok())
}

/// Polling interval for devices that do not declare one
pub fn get_default_interval() -> u32 {
    from_env(POLLER_INTERVAL)
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_INTERVAL_SECS)
}

pub fn get_worker_count() -> Option<usize> {
    from_env(POLLER_WORKERS)
}

pub fn get_concurrent_polls() -> Option<usize> {
    from_env(POLLER_CONCURRENT)
}

pub fn get_tick_interval() -> Option<u64> {
    from_env(POLLER_TICK)
}

pub fn get_timeout() -> Option<u64> {
    from_env(POLLER_TIMEOUT)
}

pub fn get_retry_attempts() -> Option<u32> {
    from_env(POLLER_RETRY)
}
