// Event pump: turns replication positions on the `events` stream into PDUs
// queued for every interested remote, then advances the durable cursor.
use fedrelay_federation::{server_part, PduEvent, MAX_PDUS_PER_TRANSACTION};
use fedrelay_replication::StreamUpdate;
use fedrelay_storage::{EventRow, FederationStore, EVENTS_POSITION};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::sender::FederationSender;

pub struct EventPump {
    sender: Arc<FederationSender>,
    store: Arc<dyn FederationStore>,
}

impl EventPump {
    pub fn new(sender: Arc<FederationSender>, store: Arc<dyn FederationStore>) -> Self {
        Self { sender, store }
    }

    /// Consume `events` stream updates until shutdown. Row payloads are not
    /// used: the position alone drives a storage read, which keeps this
    /// correct across reconnects and missed rows.
    pub async fn run(
        self,
        mut updates: mpsc::UnboundedReceiver<StreamUpdate<serde_json::Value>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                update = updates.recv() => {
                    let Some(update) = update else { return };
                    let top = match update.position.parse::<i64>() {
                        Ok(top) => top,
                        Err(err) => {
                            tracing::error!(
                                position = %update.position,
                                error = %err,
                                "events stream position is not numeric"
                            );
                            continue;
                        }
                    };
                    if let Err(err) = self.process_up_to(top).await {
                        // Cursor untouched; the next position retries the range.
                        tracing::error!(error = %err, "event pump iteration failed");
                    }
                }
            }
        }
    }

    /// Catch the durable cursor up to `top`, batch by batch. A full batch
    /// means storage may hold more rows below `top`, so the cursor advances
    /// only to the last row seen and the range is re-read from there.
    pub async fn process_up_to(&self, top: i64) -> anyhow::Result<()> {
        loop {
            let last = self.store.stream_position(EVENTS_POSITION).await?;
            if last >= top {
                return Ok(());
            }
            let rows = self
                .store
                .events_between(last, top, MAX_PDUS_PER_TRANSACTION as i64)
                .await?;
            if rows.is_empty() {
                self.store
                    .update_stream_position(EVENTS_POSITION, top)
                    .await?;
                return Ok(());
            }
            let full_batch = rows.len() == MAX_PDUS_PER_TRANSACTION;
            let batch_top = if full_batch {
                rows.last().map(|row| row.stream_id).unwrap_or(top)
            } else {
                top
            };
            metrics::counter!("federation_event_rows_total").increment(rows.len() as u64);
            for row in rows {
                self.process_event(row).await;
            }
            // At-least-once: the queue owns delivery from here on, so the
            // cursor commits once the batch is enqueued.
            self.store
                .update_stream_position(EVENTS_POSITION, batch_top)
                .await?;
            if !full_batch {
                return Ok(());
            }
        }
    }

    async fn process_event(&self, row: EventRow) {
        // Only originate events authored on this server.
        if server_part(&row.sender) != Some(self.sender.origin()) {
            return;
        }
        let hosts = match self.store.joined_hosts(&row.room_id).await {
            Ok(hosts) => hosts,
            Err(err) => {
                tracing::error!(
                    event_id = %row.event_id,
                    room_id = %row.room_id,
                    error = %err,
                    "failed to resolve joined hosts; skipping event"
                );
                return;
            }
        };
        let remotes: Vec<String> = hosts
            .into_iter()
            .filter(|host| host != self.sender.origin())
            .collect();
        if remotes.is_empty() {
            return;
        }
        let pdu = match PduEvent::from_stored(row.format_version, row.json) {
            Ok(pdu) => pdu,
            Err(err) => {
                tracing::error!(
                    event_id = %row.event_id,
                    error = %err,
                    "stored event does not build a wire pdu; skipping"
                );
                return;
            }
        };
        self.sender.send_pdu(&remotes, pdu).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fedrelay_federation::{
        FederationTransport, QueueConfig, SendError, Transaction,
    };
    use fedrelay_storage::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Records delivered transactions; always succeeds.
    #[derive(Default)]
    struct RecordingTransport {
        delivered: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingTransport {
        fn delivered_pdus(&self, destination: &str) -> usize {
            self.delivered
                .lock()
                .expect("delivered")
                .iter()
                .filter(|(dest, _)| dest == destination)
                .map(|(_, pdus)| pdus)
                .sum()
        }
    }

    #[async_trait]
    impl FederationTransport for RecordingTransport {
        async fn send_transaction(&self, transaction: &Transaction) -> Result<(), SendError> {
            self.delivered
                .lock()
                .expect("delivered")
                .push((transaction.destination.clone(), transaction.pdus.len()));
            Ok(())
        }
    }

    fn stored_json(sender: &str) -> serde_json::Value {
        json!({
            "room_id": "!room:hs.example.org",
            "sender": sender,
            "origin_server_ts": 1_714_822_861_000i64,
            "type": "m.room.message",
            "content": {"body": "hi"},
            "depth": 1,
            "auth_events": [],
            "prev_events": [],
        })
    }

    async fn seed_events(store: &MemoryStore, range: std::ops::RangeInclusive<i64>, sender: &str) {
        for stream_id in range {
            store
                .add_event(EventRow {
                    stream_id,
                    event_id: format!("$event-{stream_id}"),
                    room_id: "!room:hs.example.org".to_string(),
                    sender: sender.to_string(),
                    format_version: 2,
                    json: stored_json(sender),
                })
                .await;
        }
    }

    async fn pump_with(
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
    ) -> (EventPump, Arc<FederationSender>) {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let sender = FederationSender::new(
            Arc::clone(&store) as Arc<dyn FederationStore>,
            transport as Arc<dyn FederationTransport>,
            QueueConfig::new("hs.example.org"),
            rx,
        );
        (
            EventPump::new(Arc::clone(&sender), store as Arc<dyn FederationStore>),
            sender,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn full_batches_iterate_and_commit_the_cursor_per_batch() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_membership("!room:hs.example.org", "@alice:hs.example.org", "join")
            .await;
        store
            .add_membership("!room:hs.example.org", "@bob:remote.example", "join")
            .await;
        // 60 local events in (100, 160].
        seed_events(&store, 101..=160, "@alice:hs.example.org").await;
        store
            .update_stream_position(EVENTS_POSITION, 100)
            .await
            .expect("seed cursor");

        let transport = Arc::new(RecordingTransport::default());
        let (pump, _sender) = pump_with(Arc::clone(&store), Arc::clone(&transport)).await;
        pump.process_up_to(160).await.expect("pump");

        // Two internal iterations: 50 rows then 10, with the final cursor
        // written exactly once.
        assert_eq!(
            store.position_writes(EVENTS_POSITION).await,
            vec![100, 150, 160]
        );
        assert_eq!(
            store
                .stream_position(EVENTS_POSITION)
                .await
                .expect("cursor"),
            160
        );
        let delivered = wait_until(
            || transport.delivered_pdus("remote.example") == 60,
            Duration::from_secs(5),
        )
        .await;
        assert!(delivered, "all 60 events reach the remote");
    }

    #[tokio::test]
    async fn remote_authored_events_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_membership("!room:hs.example.org", "@bob:remote.example", "join")
            .await;
        seed_events(&store, 1..=5, "@bob:remote.example").await;

        let transport = Arc::new(RecordingTransport::default());
        let (pump, sender) = pump_with(Arc::clone(&store), Arc::clone(&transport)).await;
        pump.process_up_to(5).await.expect("pump");

        assert_eq!(sender.queue().pending_count("remote.example"), 0);
        assert_eq!(
            store
                .stream_position(EVENTS_POSITION)
                .await
                .expect("cursor"),
            5
        );
        assert_eq!(transport.delivered_pdus("remote.example"), 0);
    }

    #[tokio::test]
    async fn rooms_with_no_remote_members_enqueue_nothing() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_membership("!room:hs.example.org", "@alice:hs.example.org", "join")
            .await;
        seed_events(&store, 1..=3, "@alice:hs.example.org").await;

        let transport = Arc::new(RecordingTransport::default());
        let (pump, _sender) = pump_with(Arc::clone(&store), Arc::clone(&transport)).await;
        pump.process_up_to(3).await.expect("pump");
        assert_eq!(transport.delivered_pdus("remote.example"), 0);
    }

    #[tokio::test]
    async fn position_without_rows_still_advances_the_cursor() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let (pump, _sender) = pump_with(Arc::clone(&store), transport).await;
        pump.process_up_to(42).await.expect("pump");
        assert_eq!(
            store
                .stream_position(EVENTS_POSITION)
                .await
                .expect("cursor"),
            42
        );
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = Arc::new(MemoryStore::new());
        store
            .update_stream_position(EVENTS_POSITION, 50)
            .await
            .expect("seed cursor");
        let transport = Arc::new(RecordingTransport::default());
        let (pump, _sender) = pump_with(Arc::clone(&store), transport).await;
        // A stale position below the cursor is a no-op.
        pump.process_up_to(40).await.expect("pump");
        assert_eq!(
            store
                .stream_position(EVENTS_POSITION)
                .await
                .expect("cursor"),
            50
        );
        assert_eq!(store.position_writes(EVENTS_POSITION).await, vec![50]);
    }
}
