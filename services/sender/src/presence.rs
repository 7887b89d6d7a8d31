// Presence pump: fan local users' presence out to every remote that shares
// a room with them.
use fedrelay_federation::{
    format_presence_content, server_part, unix_millis, EduEvent, PresenceState, EDU_PRESENCE,
};
use fedrelay_replication::StreamUpdate;
use fedrelay_storage::FederationStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::sender::FederationSender;

pub struct PresencePump {
    sender: Arc<FederationSender>,
    store: Arc<dyn FederationStore>,
}

impl PresencePump {
    pub fn new(sender: Arc<FederationSender>, store: Arc<dyn FederationStore>) -> Self {
        Self { sender, store }
    }

    pub async fn run(
        self,
        mut updates: mpsc::UnboundedReceiver<StreamUpdate<PresenceState>>,
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
                    if let Err(err) = self.process_batch(update.rows).await {
                        tracing::error!(error = %err, "presence batch failed; next update retries");
                    }
                }
            }
        }
    }

    /// Coalesce a batch by user (later state wins), then queue one
    /// `m.presence` EDU per (host, user).
    pub async fn process_batch(&self, rows: Vec<PresenceState>) -> anyhow::Result<()> {
        let mut by_user: HashMap<String, PresenceState> = HashMap::new();
        for presence in rows {
            // Only local users' presence is ours to broadcast.
            if server_part(&presence.user_id) != Some(self.sender.origin()) {
                continue;
            }
            by_user.insert(presence.user_id.clone(), presence);
        }
        if by_user.is_empty() {
            return Ok(());
        }

        let user_ids: Vec<String> = by_user.keys().cloned().collect();
        let interested = self.store.hosts_sharing_rooms_with(&user_ids).await?;
        let now = unix_millis();
        for (user_id, presence) in by_user {
            let Some(hosts) = interested.get(&user_id) else {
                continue;
            };
            for host in hosts {
                if host == self.sender.origin() {
                    continue;
                }
                let edu = EduEvent::new(
                    host,
                    self.sender.origin(),
                    EDU_PRESENCE,
                    format_presence_content(&presence, now),
                )
                .with_internal_key(format!("{EDU_PRESENCE}:{user_id}"));
                self.sender.send_edu(edu).await;
            }
        }
        Ok(())
    }
}
