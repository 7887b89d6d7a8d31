// Replication wiring: resubscribe from the durable cursor and reconnect
// with bounded exponential backoff when the link drops.
use fedrelay_replication::{
    Error as ReplicationError, ReplicationClient, ReplicationConfig, StreamRegistry,
    StreamSubscription,
};
use fedrelay_storage::{FederationStore, EVENTS_POSITION};
use fedrelay_wire::LATEST_POSITION;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub const EVENTS_STREAM: &str = "events";
pub const PRESENCE_STREAM: &str = "presence";
pub const DEVICE_MESSAGES_STREAM: &str = "device_messages";

const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
// A connection that stayed up this long earns a fresh backoff schedule.
const STABLE_CONNECTION: Duration = Duration::from_secs(30);

/// Run replication until shutdown. Socket drops and remote `ERROR`s
/// reconnect with 1 s -> 30 s doubling; a protocol parse failure means we
/// do not speak the listener's dialect and is returned to the caller as
/// unrecoverable.
pub async fn run_replication(
    config: ReplicationConfig,
    registry: Arc<StreamRegistry>,
    store: Arc<dyn FederationStore>,
    mut shutdown: watch::Receiver<bool>,
) -> fedrelay_replication::Result<()> {
    let mut delay = MIN_RECONNECT_DELAY;
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let subscriptions = build_subscriptions(store.as_ref()).await;
        let client = ReplicationClient::new(config.clone(), Arc::clone(&registry));
        let started = Instant::now();
        match client.run(subscriptions, shutdown.clone()).await {
            Ok(()) => return Ok(()),
            Err(err @ ReplicationError::Protocol(_)) => {
                tracing::error!(error = %err, "replication protocol mismatch; giving up");
                return Err(err);
            }
            Err(err) => {
                metrics::counter!("replication_reconnects_total").increment(1);
                if started.elapsed() >= STABLE_CONNECTION {
                    delay = MIN_RECONNECT_DELAY;
                }
                tracing::warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "replication connection lost; reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    }
}

/// The events stream resumes from the durable cursor so no rows are skipped
/// across restarts; the ephemeral streams start from latest.
async fn build_subscriptions(store: &dyn FederationStore) -> Vec<StreamSubscription> {
    let events_position = match store.stream_position(EVENTS_POSITION).await {
        Ok(position) if position > 0 => position.to_string(),
        Ok(_) => LATEST_POSITION.to_string(),
        Err(err) => {
            tracing::error!(error = %err, "cursor read failed; subscribing from latest");
            LATEST_POSITION.to_string()
        }
    };
    vec![
        StreamSubscription::new(EVENTS_STREAM, events_position),
        StreamSubscription::new(PRESENCE_STREAM, LATEST_POSITION),
        StreamSubscription::new(DEVICE_MESSAGES_STREAM, LATEST_POSITION),
    ]
}
