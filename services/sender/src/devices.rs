// Device pump: replication pokes on the device-message stream name a
// destination whose outbox has new rows; the sender does the actual reads.
use fedrelay_replication::StreamUpdate;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::sender::FederationSender;

/// One row on the `device_messages` stream.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeviceStreamRow {
    pub destination: String,
}

pub struct DevicePump {
    sender: Arc<FederationSender>,
}

impl DevicePump {
    pub fn new(sender: Arc<FederationSender>) -> Self {
        Self { sender }
    }

    pub async fn run(
        self,
        mut updates: mpsc::UnboundedReceiver<StreamUpdate<DeviceStreamRow>>,
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
                    self.process_rows(update.rows).await;
                }
            }
        }
    }

    pub async fn process_rows(&self, rows: Vec<DeviceStreamRow>) {
        // A batch often pokes the same destination repeatedly; query once.
        let destinations: BTreeSet<String> =
            rows.into_iter().map(|row| row.destination).collect();
        for destination in destinations {
            self.sender.send_device_messages(&destination).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fedrelay_federation::{
        FederationTransport, QueueConfig, SendError, Transaction, EDU_DIRECT_TO_DEVICE,
    };
    use fedrelay_storage::{FederationStore, MemoryStore, OutboxRow};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingTransport {
        device_edus: AtomicUsize,
    }

    #[async_trait]
    impl FederationTransport for CountingTransport {
        async fn send_transaction(&self, transaction: &Transaction) -> Result<(), SendError> {
            let device_edus = transaction
                .edus
                .iter()
                .filter(|edu| edu.edu_type == EDU_DIRECT_TO_DEVICE)
                .count();
            self.device_edus.fetch_add(device_edus, Ordering::SeqCst);
            Ok(())
        }
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
    async fn stream_rows_trigger_outbox_delivery() {
        let store = Arc::new(MemoryStore::new());
        for stream_id in [11, 12] {
            store
                .add_device_message(OutboxRow {
                    destination: "remote.example".to_string(),
                    stream_id,
                    messages_json: json!({"messages": {}}),
                })
                .await;
        }
        let transport = Arc::new(CountingTransport::default());
        let (_tx, rx) = watch::channel(false);
        let sender = FederationSender::new(
            Arc::clone(&store) as Arc<dyn FederationStore>,
            Arc::clone(&transport) as Arc<dyn FederationTransport>,
            QueueConfig::new("hs.example.org"),
            rx,
        );
        let pump = DevicePump::new(sender);

        // Duplicate pokes collapse into one query pass.
        pump.process_rows(vec![
            DeviceStreamRow {
                destination: "remote.example".to_string(),
            },
            DeviceStreamRow {
                destination: "remote.example".to_string(),
            },
        ])
        .await;

        let delivered = wait_until(
            || transport.device_edus.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5),
        )
        .await;
        assert!(delivered, "both outbox rows delivered exactly once");
        // Deletion happens in the sent-hook just after delivery.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if store.outbox_stream_ids("remote.example").await.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                panic!("delivered rows were not pruned from the outbox");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
