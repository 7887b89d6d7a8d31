// Storage contracts consumed by the federation sender.
//
// The sender only ever reads event/membership state and maintains three
// small pieces of durable bookkeeping: the per-stream cursor, the device
// message outbox, and the device-list poke table. Everything is expressed
// against the `FederationStore` trait so the pumps can run against the
// in-memory backend in tests and Postgres in production.
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Durable cursor key for the room-event stream.
pub const EVENTS_POSITION: &str = "events";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One row of the events view, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub stream_id: i64,
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    /// Event format version; `1` selects the v1 wire shape.
    pub format_version: i64,
    /// The stored event content, as persisted at append time.
    pub json: serde_json::Value,
}

/// A pending device message bound for one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub destination: String,
    pub stream_id: i64,
    pub messages_json: serde_json::Value,
}

/// A pending device-list update bound for one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct PokeRow {
    pub destination: String,
    pub stream_id: i64,
    pub user_id: String,
    pub sent: bool,
}

#[async_trait]
pub trait FederationStore: Send + Sync {
    /// Current durable cursor for a stream kind; `0` when never written.
    async fn stream_position(&self, kind: &str) -> StoreResult<i64>;

    async fn update_stream_position(&self, kind: &str, position: i64) -> StoreResult<()>;

    /// Events in the half-open range `(after, upto]`, stream order, at most
    /// `limit` rows.
    async fn events_between(&self, after: i64, upto: i64, limit: i64)
        -> StoreResult<Vec<EventRow>>;

    /// Distinct server names with at least one joined member in the room.
    /// The caller excludes itself.
    async fn joined_hosts(&self, room_id: &str) -> StoreResult<Vec<String>>;

    /// For each given user, the distinct server names sharing at least one
    /// joined room with that user. One grouped query, not per-room loops.
    async fn hosts_sharing_rooms_with(
        &self,
        user_ids: &[String],
    ) -> StoreResult<HashMap<String, Vec<String>>>;

    /// Unsent outbox rows for a destination with `stream_id > after`.
    async fn pending_device_messages(
        &self,
        destination: &str,
        after: i64,
        limit: i64,
    ) -> StoreResult<Vec<OutboxRow>>;

    async fn delete_device_messages(
        &self,
        destination: &str,
        stream_ids: &[i64],
    ) -> StoreResult<()>;

    /// Unsent device-list pokes for a destination with `stream_id > after`.
    async fn pending_device_list_pokes(
        &self,
        destination: &str,
        after: i64,
        limit: i64,
    ) -> StoreResult<Vec<PokeRow>>;

    async fn mark_device_list_pokes_sent(
        &self,
        destination: &str,
        pokes: &[(i64, String)],
    ) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}
