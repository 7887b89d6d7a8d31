// In-memory implementation of the federation store.
//
// Exists for tests and local development: no external dependencies, state
// lost on restart, consistent within one process. Seeding helpers mirror
// the rows a real homeserver database would hold, and the position log
// lets tests assert exactly when the durable cursor moved.
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{EventRow, FederationStore, OutboxRow, PokeRow, StoreResult};

#[derive(Debug, Clone)]
struct MembershipRow {
    room_id: String,
    user_id: String,
    membership: String,
}

#[derive(Default)]
pub struct MemoryStore {
    positions: RwLock<HashMap<String, i64>>,
    position_log: RwLock<Vec<(String, i64)>>,
    events: RwLock<Vec<EventRow>>,
    memberships: RwLock<Vec<MembershipRow>>,
    outbox: RwLock<Vec<OutboxRow>>,
    pokes: RwLock<Vec<PokeRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_event(&self, event: EventRow) {
        let mut events = self.events.write().await;
        events.push(event);
        events.sort_by_key(|row| row.stream_id);
    }

    pub async fn add_membership(&self, room_id: &str, user_id: &str, membership: &str) {
        self.memberships.write().await.push(MembershipRow {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            membership: membership.to_string(),
        });
    }

    pub async fn add_device_message(&self, row: OutboxRow) {
        let mut outbox = self.outbox.write().await;
        outbox.push(row);
        outbox.sort_by_key(|row| row.stream_id);
    }

    pub async fn add_device_list_poke(&self, row: PokeRow) {
        let mut pokes = self.pokes.write().await;
        pokes.push(row);
        pokes.sort_by_key(|row| row.stream_id);
    }

    /// Remaining outbox stream ids for a destination, in order.
    pub async fn outbox_stream_ids(&self, destination: &str) -> Vec<i64> {
        self.outbox
            .read()
            .await
            .iter()
            .filter(|row| row.destination == destination)
            .map(|row| row.stream_id)
            .collect()
    }

    pub async fn poke_sent(&self, destination: &str, stream_id: i64) -> bool {
        self.pokes
            .read()
            .await
            .iter()
            .any(|row| row.destination == destination && row.stream_id == stream_id && row.sent)
    }

    /// Every value ever written for a cursor kind, in write order.
    pub async fn position_writes(&self, kind: &str) -> Vec<i64> {
        self.position_log
            .read()
            .await
            .iter()
            .filter(|(written, _)| written == kind)
            .map(|(_, position)| *position)
            .collect()
    }
}

fn server_part(user_id: &str) -> Option<&str> {
    let (_, server) = user_id.split_once(':')?;
    if server.is_empty() {
        None
    } else {
        Some(server)
    }
}

#[async_trait]
impl FederationStore for MemoryStore {
    async fn stream_position(&self, kind: &str) -> StoreResult<i64> {
        Ok(self.positions.read().await.get(kind).copied().unwrap_or(0))
    }

    async fn update_stream_position(&self, kind: &str, position: i64) -> StoreResult<()> {
        self.positions
            .write()
            .await
            .insert(kind.to_string(), position);
        self.position_log
            .write()
            .await
            .push((kind.to_string(), position));
        Ok(())
    }

    async fn events_between(
        &self,
        after: i64,
        upto: i64,
        limit: i64,
    ) -> StoreResult<Vec<EventRow>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|row| row.stream_id > after && row.stream_id <= upto)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn joined_hosts(&self, room_id: &str) -> StoreResult<Vec<String>> {
        let memberships = self.memberships.read().await;
        let mut hosts: Vec<String> = memberships
            .iter()
            .filter(|row| row.room_id == room_id && row.membership == "join")
            .filter_map(|row| server_part(&row.user_id))
            .map(str::to_string)
            .collect();
        hosts.sort();
        hosts.dedup();
        Ok(hosts)
    }

    async fn hosts_sharing_rooms_with(
        &self,
        user_ids: &[String],
    ) -> StoreResult<HashMap<String, Vec<String>>> {
        let memberships = self.memberships.read().await;
        let mut result = HashMap::new();
        for user_id in user_ids {
            let rooms: Vec<&str> = memberships
                .iter()
                .filter(|row| &row.user_id == user_id && row.membership == "join")
                .map(|row| row.room_id.as_str())
                .collect();
            let mut hosts: Vec<String> = memberships
                .iter()
                .filter(|row| rooms.contains(&row.room_id.as_str()) && row.membership == "join")
                .filter_map(|row| server_part(&row.user_id))
                .map(str::to_string)
                .collect();
            hosts.sort();
            hosts.dedup();
            result.insert(user_id.clone(), hosts);
        }
        Ok(result)
    }

    async fn pending_device_messages(
        &self,
        destination: &str,
        after: i64,
        limit: i64,
    ) -> StoreResult<Vec<OutboxRow>> {
        Ok(self
            .outbox
            .read()
            .await
            .iter()
            .filter(|row| row.destination == destination && row.stream_id > after)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn delete_device_messages(
        &self,
        destination: &str,
        stream_ids: &[i64],
    ) -> StoreResult<()> {
        self.outbox
            .write()
            .await
            .retain(|row| row.destination != destination || !stream_ids.contains(&row.stream_id));
        Ok(())
    }

    async fn pending_device_list_pokes(
        &self,
        destination: &str,
        after: i64,
        limit: i64,
    ) -> StoreResult<Vec<PokeRow>> {
        Ok(self
            .pokes
            .read()
            .await
            .iter()
            .filter(|row| row.destination == destination && !row.sent && row.stream_id > after)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_device_list_pokes_sent(
        &self,
        destination: &str,
        pokes: &[(i64, String)],
    ) -> StoreResult<()> {
        let mut rows = self.pokes.write().await;
        for row in rows.iter_mut() {
            if row.destination == destination
                && pokes
                    .iter()
                    .any(|(stream_id, user_id)| {
                        *stream_id == row.stream_id && user_id == &row.user_id
                    })
            {
                row.sent = true;
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
