//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FETCH_CACHE_SIZE: usize = 128;
pub const DEFAULT_CACHE_THRESHOLD: usize = 4;
pub const DEFAULT_YIELD_COST: u64 = 10_000;
pub const DEFAULT_BLOB_LIMIT: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_VERSION_CHAIN: usize = 100_000;

/// What a scan does when a row lock is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockWaitPolicy {
    /// Wait inside the fetch call, with every page latch released.
    Block,
    /// Return `ScanOutcome::LockWait` and resume on the next fetch.
    Return,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Rows prefetched per cache fill.
    pub fetch_cache_size: usize,
    /// Consecutive same-direction fetches before the cache is used.
    pub cache_threshold: usize,
    /// Records examined per fetch call before the scan yields. 0 disables.
    pub yield_cost: u64,
    pub lock_wait_timeout: Duration,
    pub lock_wait_policy: LockWaitPolicy,
    /// Bytes of large column values one fetch may materialize.
    pub blob_limit: usize,
    /// Skip leaves that fail verification instead of failing the scan.
    pub best_effort_recovery: bool,
    pub max_version_chain: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fetch_cache_size: DEFAULT_FETCH_CACHE_SIZE,
            cache_threshold: DEFAULT_CACHE_THRESHOLD,
            yield_cost: DEFAULT_YIELD_COST,
            lock_wait_timeout: Duration::from_secs(50),
            lock_wait_policy: LockWaitPolicy::Block,
            blob_limit: DEFAULT_BLOB_LIMIT,
            best_effort_recovery: false,
            max_version_chain: DEFAULT_MAX_VERSION_CHAIN,
        }
    }
}

impl SearchConfig {
    /// Defaults overridden by `ROWSEEK_*` environment variables. Values that
    /// do not parse are ignored with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fetch_cache_size: env_or("ROWSEEK_FETCH_CACHE_SIZE", defaults.fetch_cache_size),
            cache_threshold: env_or("ROWSEEK_CACHE_THRESHOLD", defaults.cache_threshold),
            yield_cost: env_or("ROWSEEK_YIELD_COST", defaults.yield_cost),
            lock_wait_timeout: Duration::from_millis(env_or(
                "ROWSEEK_LOCK_WAIT_MS",
                defaults.lock_wait_timeout.as_millis() as u64,
            )),
            blob_limit: env_or("ROWSEEK_BLOB_LIMIT", defaults.blob_limit),
            best_effort_recovery: env_flag("ROWSEEK_FORCE_RECOVERY", defaults.best_effort_recovery),
            ..defaults
        }
    }

    pub fn with_fetch_cache_size(mut self, rows: usize) -> Self {
        self.fetch_cache_size = rows;
        self
    }

    pub fn with_cache_threshold(mut self, fetches: usize) -> Self {
        self.cache_threshold = fetches;
        self
    }

    pub fn with_yield_cost(mut self, records: u64) -> Self {
        self.yield_cost = records;
        self
    }

    pub fn with_lock_wait(mut self, timeout: Duration, policy: LockWaitPolicy) -> Self {
        self.lock_wait_timeout = timeout;
        self.lock_wait_policy = policy;
        self
    }

    pub fn with_blob_limit(mut self, bytes: usize) -> Self {
        self.blob_limit = bytes;
        self
    }

    pub fn with_best_effort_recovery(mut self, enabled: bool) -> Self {
        self.best_effort_recovery = enabled;
        self
    }

    pub fn with_max_version_chain(mut self, versions: usize) -> Self {
        self.max_version_chain = versions;
        self
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("ignoring {name}={raw}: not a valid value");
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                log::warn!("ignoring {name}={raw}: expected a boolean");
                default
            }
        },
        Err(_) => default,
    }
}
