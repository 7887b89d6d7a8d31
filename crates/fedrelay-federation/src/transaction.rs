// Outbound federation transactions and id minting.
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{EduEvent, PduEvent};

/// Hard cap on PDUs per transaction.
pub const MAX_PDUS_PER_TRANSACTION: usize = 50;
/// Hard cap on EDUs per transaction.
pub const MAX_EDUS_PER_TRANSACTION: usize = 100;

/// One unit of federation delivery.
///
/// `transaction_id` rides in the request path and `destination` in the
/// routing layer, so neither appears in the HTTP body.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    #[serde(skip)]
    pub transaction_id: String,
    pub origin: String,
    pub origin_server_ts: i64,
    #[serde(skip)]
    pub destination: String,
    pub pdus: Vec<PduEvent>,
    pub edus: Vec<EduEvent>,
}

impl Transaction {
    pub fn new(
        transaction_id: String,
        origin: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id,
            origin: origin.into(),
            origin_server_ts: unix_millis(),
            destination: destination.into(),
            pdus: Vec::new(),
            edus: Vec::new(),
        }
    }

    /// Whether new items may still be appended. A transaction at either cap
    /// is closed; the next item opens a fresh one.
    pub fn has_room(&self) -> bool {
        self.pdus.len() < MAX_PDUS_PER_TRANSACTION && self.edus.len() < MAX_EDUS_PER_TRANSACTION
    }
}

/// Mints process-unique, monotonically increasing transaction ids.
///
/// Seeding from the wall clock keeps ids unique across restarts as well, as
/// long as restarts are at least a second apart per allocated id.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    next: AtomicI64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(unix_seconds()),
        }
    }

    #[cfg(test)]
    pub fn starting_at(seed: i64) -> Self {
        Self {
            next: AtomicI64::new(seed),
        }
    }

    pub fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
