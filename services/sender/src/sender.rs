// Orchestration between the pumps, the transaction queue, and storage.
//
// The sender wraps the queue with the destination bookkeeping the pumps
// share: the first time any item targets a destination this process, the
// device outbox and poke table are drained into EDUs; after a transaction
// succeeds, the sent-hook deletes the delivered outbox rows, flips the
// pokes to sent, and advances the per-destination high-water marks.
use async_trait::async_trait;
use fedrelay_federation::{
    EduEvent, FederationTransport, PduEvent, QueueConfig, SentHook, Transaction, TransactionQueue,
    EDU_DEVICE_LIST_UPDATE, EDU_DIRECT_TO_DEVICE,
};
use fedrelay_storage::FederationStore;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Upper bound on device items loaded per destination poke.
const DEVICE_BATCH_LIMIT: usize = 100;

#[derive(Default)]
struct DeviceState {
    // Destinations that have had their catch-up query this process.
    seen: Mutex<HashSet<String>>,
    // Highest stream id confirmed delivered, per destination. Advanced by
    // the sent-hook only.
    sent_messages: Mutex<HashMap<String, i64>>,
    sent_pokes: Mutex<HashMap<String, i64>>,
    // Highest stream id already queued this process, so a replication poke
    // does not re-queue rows that are pending but unsent.
    queued_messages: Mutex<HashMap<String, i64>>,
    queued_pokes: Mutex<HashMap<String, i64>>,
}

fn mark(map: &Mutex<HashMap<String, i64>>, destination: &str) -> i64 {
    map.lock()
        .expect("device mark lock")
        .get(destination)
        .copied()
        .unwrap_or(0)
}

fn raise_mark(map: &Mutex<HashMap<String, i64>>, destination: &str, stream_id: i64) {
    let mut map = map.lock().expect("device mark lock");
    let entry = map.entry(destination.to_string()).or_insert(0);
    *entry = (*entry).max(stream_id);
}

pub struct FederationSender {
    origin: String,
    queue: TransactionQueue,
    store: Arc<dyn FederationStore>,
    devices: Arc<DeviceState>,
}

impl FederationSender {
    pub fn new(
        store: Arc<dyn FederationStore>,
        transport: Arc<dyn FederationTransport>,
        config: QueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let origin = config.origin.clone();
        let devices = Arc::new(DeviceState::default());
        let hook = Arc::new(DeviceCleanupHook {
            store: Arc::clone(&store),
            devices: Arc::clone(&devices),
        });
        let queue = TransactionQueue::new(config, transport, hook, shutdown);
        Arc::new(Self {
            origin,
            queue,
            store,
            devices,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn queue(&self) -> &TransactionQueue {
        &self.queue
    }

    /// Route one PDU to each interested remote and kick their senders.
    pub async fn send_pdu(&self, hosts: &[String], pdu: PduEvent) {
        for host in hosts {
            if host == &self.origin {
                continue;
            }
            self.ensure_destination(host).await;
            self.queue.enqueue_pdu(host, pdu.clone());
            self.queue.kick(host);
        }
    }

    pub async fn send_edu(&self, edu: EduEvent) {
        if edu.destination == self.origin {
            return;
        }
        let destination = edu.destination.clone();
        self.ensure_destination(&destination).await;
        self.queue.enqueue_edu(edu);
        self.queue.kick(&destination);
    }

    /// Load pending device messages and device-list pokes for a destination
    /// (above the high-water marks) and queue them as EDUs.
    pub async fn send_device_messages(&self, destination: &str) {
        if destination == self.origin {
            return;
        }
        let message_mark = mark(&self.devices.sent_messages, destination)
            .max(mark(&self.devices.queued_messages, destination));
        let messages = match self
            .store
            .pending_device_messages(destination, message_mark, DEVICE_BATCH_LIMIT as i64)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                tracing::error!(
                    destination = %destination,
                    error = %err,
                    "failed to read device outbox; will retry on the next poke"
                );
                return;
            }
        };

        let poke_budget = DEVICE_BATCH_LIMIT.saturating_sub(messages.len());
        let pokes = if poke_budget > 0 {
            let poke_mark = mark(&self.devices.sent_pokes, destination)
                .max(mark(&self.devices.queued_pokes, destination));
            match self
                .store
                .pending_device_list_pokes(destination, poke_mark, poke_budget as i64)
                .await
            {
                Ok(pokes) => pokes,
                Err(err) => {
                    tracing::error!(
                        destination = %destination,
                        error = %err,
                        "failed to read device-list pokes; will retry on the next poke"
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        if messages.is_empty() && pokes.is_empty() {
            return;
        }
        for row in messages {
            raise_mark(&self.devices.queued_messages, destination, row.stream_id);
            self.queue.enqueue_edu(
                EduEvent::new(
                    destination,
                    &self.origin,
                    EDU_DIRECT_TO_DEVICE,
                    row.messages_json,
                )
                .with_stream_id(row.stream_id),
            );
        }
        for poke in pokes {
            raise_mark(&self.devices.queued_pokes, destination, poke.stream_id);
            self.queue.enqueue_edu(
                EduEvent::new(
                    destination,
                    &self.origin,
                    EDU_DEVICE_LIST_UPDATE,
                    json!({
                        "user_id": poke.user_id,
                        "stream_id": poke.stream_id,
                    }),
                )
                .with_stream_id(poke.stream_id),
            );
        }
        self.queue.kick(destination);
    }

    /// Highest device-message stream id confirmed delivered to the
    /// destination.
    pub fn last_device_message_stream_id(&self, destination: &str) -> i64 {
        mark(&self.devices.sent_messages, destination)
    }

    async fn ensure_destination(&self, destination: &str) {
        let first_time = self
            .devices
            .seen
            .lock()
            .expect("seen destinations lock")
            .insert(destination.to_string());
        if first_time {
            self.send_device_messages(destination).await;
        }
    }
}

struct DeviceCleanupHook {
    store: Arc<dyn FederationStore>,
    devices: Arc<DeviceState>,
}

#[async_trait]
impl SentHook for DeviceCleanupHook {
    async fn transaction_sent(&self, transaction: &Transaction) {
        let destination = transaction.destination.as_str();
        let mut message_ids = Vec::new();
        let mut pokes = Vec::new();
        for edu in &transaction.edus {
            match edu.edu_type.as_str() {
                EDU_DIRECT_TO_DEVICE => {
                    if let Some(stream_id) = edu.stream_id {
                        message_ids.push(stream_id);
                    }
                }
                EDU_DEVICE_LIST_UPDATE => {
                    if let (Some(stream_id), Some(user_id)) = (
                        edu.stream_id,
                        edu.content.get("user_id").and_then(|value| value.as_str()),
                    ) {
                        pokes.push((stream_id, user_id.to_string()));
                    }
                }
                _ => {}
            }
        }

        if !message_ids.is_empty() {
            match self
                .store
                .delete_device_messages(destination, &message_ids)
                .await
            {
                Ok(()) => {
                    if let Some(max) = message_ids.iter().max() {
                        raise_mark(&self.devices.sent_messages, destination, *max);
                    }
                }
                Err(err) => {
                    // The rows will be re-sent and the peer de-dupes, so
                    // this is noisy rather than harmful.
                    tracing::error!(
                        destination = %destination,
                        error = %err,
                        "failed to prune delivered device messages"
                    );
                }
            }
        }
        if !pokes.is_empty() {
            match self
                .store
                .mark_device_list_pokes_sent(destination, &pokes)
                .await
            {
                Ok(()) => {
                    if let Some(max) = pokes.iter().map(|(stream_id, _)| *stream_id).max() {
                        raise_mark(&self.devices.sent_pokes, destination, max);
                    }
                }
                Err(err) => {
                    tracing::error!(
                        destination = %destination,
                        error = %err,
                        "failed to mark device-list pokes sent"
                    );
                }
            }
        }
    }
}
