// Per-destination failure bookkeeping and retry delays.
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How a failed send is treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry after a delay: 5xx, 429, connect/reset, TLS timeout, DNS.
    Transient,
    /// Drop the transaction: non-429 4xx, malformed responses, signing
    /// failures.
    Terminal,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffEntry {
    pub consecutive_failures: u32,
    pub next_attempt_allowed: Instant,
    pub last_classification: FailureKind,
}

/// Tracks consecutive transient failures per destination.
///
/// Entries appear on the first failure and are cleared on the first
/// subsequent success, or when a terminal classification abandons the
/// transaction.
#[derive(Debug)]
pub struct BackoffRegistry {
    config: BackoffConfig,
    entries: Mutex<HashMap<String, BackoffEntry>>,
}

impl BackoffRegistry {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one transient failure and return how long to wait before the
    /// next attempt: `min(cap, base * 2^(n-1))` scaled by a jitter factor in
    /// `[0.5, 1.5)` so a flapping remote does not synchronize its retriers.
    pub fn record_failure(&self, destination: &str) -> Duration {
        let mut entries = self.entries.lock().expect("backoff entries lock");
        let failures = entries
            .get(destination)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
            .saturating_add(1);
        let exponential = self
            .config
            .base
            .saturating_mul(1u32 << (failures - 1).min(30))
            .min(self.config.cap);
        let jitter = rand::thread_rng().gen_range(0.5f64..1.5f64);
        let delay = exponential.mul_f64(jitter);
        entries.insert(
            destination.to_string(),
            BackoffEntry {
                consecutive_failures: failures,
                next_attempt_allowed: Instant::now() + delay,
                last_classification: FailureKind::Transient,
            },
        );
        delay
    }

    pub fn clear(&self, destination: &str) {
        self.entries
            .lock()
            .expect("backoff entries lock")
            .remove(destination);
    }

    pub fn entry(&self, destination: &str) -> Option<BackoffEntry> {
        self.entries
            .lock()
            .expect("backoff entries lock")
            .get(destination)
            .cloned()
    }
}
