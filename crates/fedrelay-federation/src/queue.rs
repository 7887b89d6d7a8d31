// Per-destination outbound transaction queue.
//
// Each destination owns a FIFO of pending transactions and at most one
// sender task. Appends (from the pumps) and pops (from the sender) go
// through one lock, and the sender-active flag flips under that same lock,
// so a sender can never exit while work it has not observed sits queued.
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::backoff::{BackoffConfig, BackoffRegistry, FailureKind};
use crate::transaction::{Transaction, TransactionIdGenerator};
use crate::{EduEvent, PduEvent};

#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("transient failure sending to {destination}: {reason}")]
    Transient { destination: String, reason: String },
    #[error("terminal failure sending to {destination}: {reason}")]
    Terminal { destination: String, reason: String },
}

impl SendError {
    pub fn transient(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        SendError::Transient {
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    pub fn terminal(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        SendError::Terminal {
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SendError::Transient { .. } => FailureKind::Transient,
            SendError::Terminal { .. } => FailureKind::Terminal,
        }
    }
}

/// The signing + HTTP collaborator that actually delivers a transaction.
#[async_trait]
pub trait FederationTransport: Send + Sync + 'static {
    async fn send_transaction(&self, transaction: &Transaction) -> Result<(), SendError>;
}

/// Invoked once per successfully delivered transaction, before the sender
/// moves on. Device-outbox cleanup hangs off this.
#[async_trait]
pub trait SentHook: Send + Sync + 'static {
    async fn transaction_sent(&self, transaction: &Transaction);
}

pub struct NoopSentHook;

#[async_trait]
impl SentHook for NoopSentHook {
    async fn transaction_sent(&self, _transaction: &Transaction) {}
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Our own server name; stamped as `origin` on every transaction.
    pub origin: String,
    /// Global cap on concurrently in-flight transactions.
    pub max_concurrency: usize,
    pub backoff: BackoffConfig,
}

impl QueueConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            max_concurrency: 100,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Default)]
struct DestinationState {
    queue: VecDeque<Transaction>,
    sender_active: bool,
}

struct QueueInner {
    config: QueueConfig,
    transport: Arc<dyn FederationTransport>,
    hook: Arc<dyn SentHook>,
    permits: Arc<Semaphore>,
    backoff: BackoffRegistry,
    ids: TransactionIdGenerator,
    destinations: Mutex<HashMap<String, DestinationState>>,
    shutdown: watch::Receiver<bool>,
}

/// Routes PDUs and EDUs into per-destination transactions and drains them.
#[derive(Clone)]
pub struct TransactionQueue {
    inner: Arc<QueueInner>,
}

impl TransactionQueue {
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn FederationTransport>,
        hook: Arc<dyn SentHook>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let backoff = BackoffRegistry::new(config.backoff.clone());
        Self {
            inner: Arc::new(QueueInner {
                config,
                transport,
                hook,
                permits,
                backoff,
                ids: TransactionIdGenerator::new(),
                destinations: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    pub fn origin(&self) -> &str {
        &self.inner.config.origin
    }

    /// Append a PDU to the destination's tail transaction, opening a fresh
    /// one when the tail is at either cap.
    pub fn enqueue_pdu(&self, destination: &str, pdu: PduEvent) {
        self.with_tail(destination, |transaction| {
            transaction.pdus.push(pdu);
        });
    }

    /// Append an EDU, honoring `internal_key` replacement: a pending EDU in
    /// the tail transaction with the same key is superseded in place.
    pub fn enqueue_edu(&self, edu: EduEvent) {
        let destination = edu.destination.clone();
        if let Some(key) = edu.internal_key.clone() {
            let mut destinations = self.lock_destinations();
            let state = destinations.entry(destination.clone()).or_default();
            if let Some(tail) = state.queue.back_mut() {
                if let Some(existing) = tail
                    .edus
                    .iter_mut()
                    .find(|pending| pending.internal_key.as_deref() == Some(key.as_str()))
                {
                    *existing = edu;
                    return;
                }
            }
            drop(destinations);
        }
        self.with_tail(&destination, |transaction| {
            transaction.edus.push(edu);
        });
    }

    /// Ensure a sender task is draining the destination's queue.
    pub fn kick(&self, destination: &str) {
        let spawn = {
            let mut destinations = self.lock_destinations();
            let state = destinations.entry(destination.to_string()).or_default();
            if state.sender_active || state.queue.is_empty() {
                false
            } else {
                state.sender_active = true;
                true
            }
        };
        if spawn {
            let inner = Arc::clone(&self.inner);
            let destination = destination.to_string();
            tokio::spawn(async move {
                run_sender(inner, destination).await;
            });
        }
    }

    /// Number of queued (not in-flight) transactions for a destination.
    pub fn pending_count(&self, destination: &str) -> usize {
        self.lock_destinations()
            .get(destination)
            .map(|state| state.queue.len())
            .unwrap_or(0)
    }

    /// Total PDUs sitting in queued transactions for a destination.
    pub fn pending_pdu_count(&self, destination: &str) -> usize {
        self.lock_destinations()
            .get(destination)
            .map(|state| state.queue.iter().map(|t| t.pdus.len()).sum())
            .unwrap_or(0)
    }

    /// Total EDUs sitting in queued transactions for a destination.
    pub fn pending_edu_count(&self, destination: &str) -> usize {
        self.lock_destinations()
            .get(destination)
            .map(|state| state.queue.iter().map(|t| t.edus.len()).sum())
            .unwrap_or(0)
    }

    pub fn backoff_entry(&self, destination: &str) -> Option<crate::BackoffEntry> {
        self.inner.backoff.entry(destination)
    }

    fn with_tail(&self, destination: &str, append: impl FnOnce(&mut Transaction)) {
        let mut destinations = self.lock_destinations();
        let state = destinations.entry(destination.to_string()).or_default();
        let needs_fresh = state
            .queue
            .back()
            .map(|tail| !tail.has_room())
            .unwrap_or(true);
        if needs_fresh {
            state.queue.push_back(Transaction::new(
                self.inner.ids.next_id(),
                self.inner.config.origin.clone(),
                destination,
            ));
            metrics::counter!("federation_transactions_created_total").increment(1);
        }
        append(state.queue.back_mut().expect("tail transaction"));
    }

    fn lock_destinations(&self) -> std::sync::MutexGuard<'_, HashMap<String, DestinationState>> {
        self.inner
            .destinations
            .lock()
            .expect("destination map lock")
    }
}

async fn run_sender(inner: Arc<QueueInner>, destination: String) {
    metrics::gauge!("federation_active_senders").increment(1.0);
    let mut permit = acquire_permit(&inner).await;
    loop {
        if permit.is_none() || *inner.shutdown.borrow() {
            mark_idle(&inner, &destination);
            break;
        }
        let transaction = match pop_or_idle(&inner, &destination) {
            Some(transaction) => transaction,
            None => break,
        };
        permit = drain_one(&inner, &destination, transaction, permit).await;
    }
    metrics::gauge!("federation_active_senders").decrement(1.0);
}

/// Deliver one transaction, retrying transient failures with backoff. The
/// global permit is released for the duration of each backoff sleep so a
/// slow destination never pins a concurrency slot. Returns the permit to
/// use for the next transaction, or `None` when shutting down.
async fn drain_one(
    inner: &Arc<QueueInner>,
    destination: &str,
    transaction: Transaction,
    mut permit: Option<OwnedSemaphorePermit>,
) -> Option<OwnedSemaphorePermit> {
    loop {
        let started = Instant::now();
        metrics::gauge!("federation_transactions_in_flight").increment(1.0);
        let outcome = inner.transport.send_transaction(&transaction).await;
        metrics::gauge!("federation_transactions_in_flight").decrement(1.0);
        metrics::histogram!("federation_transaction_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        match outcome {
            Ok(()) => {
                inner.hook.transaction_sent(&transaction).await;
                inner.backoff.clear(destination);
                metrics::counter!(
                    "federation_transactions_total",
                    "outcome" => "success",
                    "destination" => destination.to_string()
                )
                .increment(1);
                tracing::info!(
                    destination = %destination,
                    transaction_id = %transaction.transaction_id,
                    pdus = transaction.pdus.len(),
                    edus = transaction.edus.len(),
                    "transaction sent"
                );
                return permit;
            }
            Err(err) if err.kind() == FailureKind::Transient => {
                let delay = inner.backoff.record_failure(destination);
                metrics::counter!(
                    "federation_transactions_total",
                    "outcome" => "retry",
                    "destination" => destination.to_string()
                )
                .increment(1);
                tracing::warn!(
                    destination = %destination,
                    transaction_id = %transaction.transaction_id,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient send failure, backing off"
                );
                // Free the slot while this destination waits.
                permit.take();
                tokio::time::sleep(delay).await;
                if *inner.shutdown.borrow() {
                    requeue_front(inner, destination, transaction);
                    return None;
                }
                permit = acquire_permit(inner).await;
                if permit.is_none() {
                    requeue_front(inner, destination, transaction);
                    return None;
                }
            }
            Err(err) => {
                inner.backoff.clear(destination);
                metrics::counter!(
                    "federation_transactions_total",
                    "outcome" => "fail",
                    "destination" => destination.to_string()
                )
                .increment(1);
                tracing::warn!(
                    destination = %destination,
                    transaction_id = %transaction.transaction_id,
                    error = %err,
                    "dropping transaction after terminal failure"
                );
                return permit;
            }
        }
    }
}

async fn acquire_permit(inner: &Arc<QueueInner>) -> Option<OwnedSemaphorePermit> {
    Arc::clone(&inner.permits).acquire_owned().await.ok()
}

fn pop_or_idle(inner: &Arc<QueueInner>, destination: &str) -> Option<Transaction> {
    let mut destinations = inner.destinations.lock().expect("destination map lock");
    let state = destinations.entry(destination.to_string()).or_default();
    match state.queue.pop_front() {
        Some(transaction) => Some(transaction),
        None => {
            state.sender_active = false;
            None
        }
    }
}

fn requeue_front(inner: &Arc<QueueInner>, destination: &str, transaction: Transaction) {
    let mut destinations = inner.destinations.lock().expect("destination map lock");
    let state = destinations.entry(destination.to_string()).or_default();
    state.queue.push_front(transaction);
    state.sender_active = false;
}

fn mark_idle(inner: &Arc<QueueInner>, destination: &str) {
    let mut destinations = inner.destinations.lock().expect("destination map lock");
    if let Some(state) = destinations.get_mut(destination) {
        state.sender_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EDU_TYPING;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Observed {
        transaction_ids: Vec<i64>,
        in_flight: usize,
        max_in_flight: usize,
        successes: usize,
    }

    impl Default for Observed {
        fn default() -> Self {
            Self {
                transaction_ids: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
                successes: 0,
            }
        }
    }

    /// Transport that records per-destination concurrency and outcomes.
    struct FakeTransport {
        delay: Duration,
        // Destinations listed here fail every attempt with the given kind.
        failures: StdHashMap<String, FailureKind>,
        observed: Mutex<StdHashMap<String, Observed>>,
        total_calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                failures: StdHashMap::new(),
                observed: Mutex::new(StdHashMap::new()),
                total_calls: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, destination: &str, kind: FailureKind) -> Self {
            self.failures.insert(destination.to_string(), kind);
            self
        }

        fn successes(&self, destination: &str) -> usize {
            self.observed
                .lock()
                .expect("observed")
                .get(destination)
                .map(|o| o.successes)
                .unwrap_or(0)
        }

        fn max_in_flight(&self, destination: &str) -> usize {
            self.observed
                .lock()
                .expect("observed")
                .get(destination)
                .map(|o| o.max_in_flight)
                .unwrap_or(0)
        }

        fn transaction_ids(&self, destination: &str) -> Vec<i64> {
            self.observed
                .lock()
                .expect("observed")
                .get(destination)
                .map(|o| o.transaction_ids.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl FederationTransport for FakeTransport {
        async fn send_transaction(&self, transaction: &Transaction) -> Result<(), SendError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut observed = self.observed.lock().expect("observed");
                let entry = observed.entry(transaction.destination.clone()).or_default();
                entry.in_flight += 1;
                entry.max_in_flight = entry.max_in_flight.max(entry.in_flight);
                entry
                    .transaction_ids
                    .push(transaction.transaction_id.parse().expect("numeric id"));
            }
            tokio::time::sleep(self.delay).await;
            let mut observed = self.observed.lock().expect("observed");
            let entry = observed.entry(transaction.destination.clone()).or_default();
            entry.in_flight -= 1;
            match self.failures.get(&transaction.destination) {
                Some(FailureKind::Transient) => Err(SendError::transient(
                    &transaction.destination,
                    "status 503",
                )),
                Some(FailureKind::Terminal) => Err(SendError::terminal(
                    &transaction.destination,
                    "status 403",
                )),
                None => {
                    entry.successes += 1;
                    Ok(())
                }
            }
        }
    }

    fn test_queue(transport: Arc<FakeTransport>, max_concurrency: usize) -> TransactionQueue {
        // Dropping the sender leaves the flag permanently false.
        let (_tx, rx) = watch::channel(false);
        let mut config = QueueConfig::new("hs.example.org");
        config.max_concurrency = max_concurrency;
        config.backoff = BackoffConfig {
            base: Duration::from_millis(200),
            cap: Duration::from_millis(400),
        };
        TransactionQueue::new(config, transport, Arc::new(NoopSentHook), rx)
    }

    fn pdu() -> PduEvent {
        PduEvent::from_stored(
            2,
            json!({
                "room_id": "!room:hs.example.org",
                "sender": "@alice:hs.example.org",
                "origin_server_ts": 1_714_822_861_000i64,
                "type": "m.room.message",
                "content": {"body": "hi"},
                "depth": 1,
                "auth_events": [],
                "prev_events": [],
            }),
        )
        .expect("pdu")
    }

    fn typing_edu(destination: &str, key: &str, body: &str) -> EduEvent {
        EduEvent::new(
            destination,
            "hs.example.org",
            EDU_TYPING,
            json!({"body": body}),
        )
        .with_internal_key(key)
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
    async fn appends_fill_the_tail_until_a_cap() {
        let transport = Arc::new(FakeTransport::new(Duration::ZERO));
        let queue = test_queue(transport, 100);
        for _ in 0..120 {
            queue.enqueue_pdu("remote.example", pdu());
        }
        // 120 PDUs at 50 per transaction: 50 + 50 + 20.
        assert_eq!(queue.pending_count("remote.example"), 3);
        let destinations = queue.lock_destinations();
        let state = destinations.get("remote.example").expect("state");
        let sizes: Vec<usize> = state.queue.iter().map(|t| t.pdus.len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[tokio::test]
    async fn edu_cap_closes_a_transaction_with_pdu_room_left() {
        let transport = Arc::new(FakeTransport::new(Duration::ZERO));
        let queue = test_queue(transport, 100);
        for index in 0..101 {
            queue.enqueue_edu(typing_edu(
                "remote.example",
                &format!("key-{index}"),
                "typing",
            ));
        }
        assert_eq!(queue.pending_count("remote.example"), 2);
        let destinations = queue.lock_destinations();
        let state = destinations.get("remote.example").expect("state");
        assert_eq!(state.queue[0].edus.len(), 100);
        assert_eq!(state.queue[1].edus.len(), 1);
    }

    #[tokio::test]
    async fn internal_key_replaces_pending_edu() {
        let transport = Arc::new(FakeTransport::new(Duration::ZERO));
        let queue = test_queue(transport, 100);
        queue.enqueue_edu(typing_edu("remote.example", "m.typing:!r:@u", "first"));
        queue.enqueue_edu(typing_edu("remote.example", "m.typing:!r:@u", "second"));
        queue.enqueue_edu(typing_edu("remote.example", "m.typing:!r:@other", "other"));

        let destinations = queue.lock_destinations();
        let state = destinations.get("remote.example").expect("state");
        assert_eq!(state.queue.len(), 1);
        let tail = state.queue.back().expect("tail");
        assert_eq!(tail.edus.len(), 2);
        assert_eq!(tail.edus[0].content["body"], "second");
        assert_eq!(tail.edus[1].content["body"], "other");
    }

    #[tokio::test]
    async fn sends_are_serialized_per_destination_with_increasing_ids() {
        let transport = Arc::new(FakeTransport::new(Duration::from_millis(20)));
        let queue = test_queue(Arc::clone(&transport), 100);
        // Three transactions' worth of PDUs.
        for _ in 0..150 {
            queue.enqueue_pdu("remote.example", pdu());
        }
        queue.kick("remote.example");
        // Kicking again while a sender runs must not start a second one.
        queue.kick("remote.example");

        let done = wait_until(
            || transport.successes("remote.example") == 3,
            Duration::from_secs(5),
        )
        .await;
        assert!(done, "expected 3 transactions to complete");
        assert_eq!(transport.max_in_flight("remote.example"), 1);
        let ids = transport.transaction_ids("remote.example");
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "ids {ids:?}");
    }

    #[tokio::test]
    async fn backoff_sleep_releases_the_global_permit() {
        let transport = Arc::new(
            FakeTransport::new(Duration::from_millis(10))
                .failing("a.example", FailureKind::Transient),
        );
        // Two permits: if the failing destination held its permit while
        // sleeping, the two healthy destinations could not both proceed.
        let queue = test_queue(Arc::clone(&transport), 2);
        for destination in ["a.example", "b.example", "c.example"] {
            for _ in 0..60 {
                queue.enqueue_pdu(destination, pdu());
            }
            queue.kick(destination);
        }
        let done = wait_until(
            || transport.successes("b.example") == 2 && transport.successes("c.example") == 2,
            Duration::from_secs(5),
        )
        .await;
        assert!(done, "healthy destinations must drain while a.example backs off");
        assert_eq!(transport.successes("a.example"), 0);
        // The failing destination never advances past its head transaction.
        assert!(queue.pending_count("a.example") >= 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_the_same_transaction() {
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO).failing("a.example", FailureKind::Transient),
        );
        let queue = test_queue(Arc::clone(&transport), 100);
        for _ in 0..60 {
            queue.enqueue_pdu("a.example", pdu());
        }
        queue.kick("a.example");
        let retried = wait_until(
            || transport.transaction_ids("a.example").len() >= 3,
            Duration::from_secs(5),
        )
        .await;
        assert!(retried, "expected repeated attempts");
        let ids = transport.transaction_ids("a.example");
        // Every attempt targets the head transaction; the queue never skips.
        assert!(ids.iter().all(|id| *id == ids[0]), "ids {ids:?}");
        let entry = queue.backoff_entry("a.example").expect("backoff entry");
        assert!(entry.consecutive_failures >= 3);
    }

    #[tokio::test]
    async fn terminal_failure_drops_and_moves_on() {
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO).failing("a.example", FailureKind::Terminal),
        );
        let queue = test_queue(Arc::clone(&transport), 100);
        for _ in 0..60 {
            queue.enqueue_pdu("a.example", pdu());
        }
        queue.kick("a.example");
        let drained = wait_until(|| queue.pending_count("a.example") == 0, Duration::from_secs(5))
            .await;
        assert!(drained, "terminal failures must not wedge the queue");
        // Both transactions were attempted exactly once and dropped.
        assert_eq!(transport.transaction_ids("a.example").len(), 2);
        assert!(queue.backoff_entry("a.example").is_none());
    }

    #[tokio::test]
    async fn success_clears_backoff() {
        struct FlakyOnce {
            failed: AtomicUsize,
        }

        #[async_trait]
        impl FederationTransport for FlakyOnce {
            async fn send_transaction(&self, transaction: &Transaction) -> Result<(), SendError> {
                if self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SendError::transient(&transaction.destination, "status 502"))
                } else {
                    Ok(())
                }
            }
        }

        let (_tx, rx) = watch::channel(false);
        let mut config = QueueConfig::new("hs.example.org");
        config.backoff = BackoffConfig {
            base: Duration::from_millis(20),
            cap: Duration::from_millis(40),
        };
        let queue = TransactionQueue::new(
            config,
            Arc::new(FlakyOnce {
                failed: AtomicUsize::new(0),
            }),
            Arc::new(NoopSentHook),
            rx,
        );
        queue.enqueue_pdu("remote.example", pdu());
        queue.kick("remote.example");
        let cleared = wait_until(
            || {
                queue.pending_count("remote.example") == 0
                    && queue.backoff_entry("remote.example").is_none()
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(cleared, "backoff must clear on the first success");
    }

    #[tokio::test]
    async fn enqueue_during_backoff_grows_the_queue() {
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO).failing("a.example", FailureKind::Transient),
        );
        let queue = test_queue(Arc::clone(&transport), 100);
        queue.enqueue_pdu("a.example", pdu());
        queue.kick("a.example");
        wait_until(
            || !transport.transaction_ids("a.example").is_empty(),
            Duration::from_secs(5),
        )
        .await;
        // The sender is asleep in backoff; new items just queue up.
        for _ in 0..50 {
            queue.enqueue_pdu("a.example", pdu());
        }
        assert!(queue.pending_count("a.example") >= 1);
    }

    #[tokio::test]
    async fn sent_hook_runs_only_on_success() {
        struct CountingHook {
            sent: AtomicUsize,
        }

        #[async_trait]
        impl SentHook for CountingHook {
            async fn transaction_sent(&self, _transaction: &Transaction) {
                self.sent.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hook = Arc::new(CountingHook {
            sent: AtomicUsize::new(0),
        });
        let transport = Arc::new(
            FakeTransport::new(Duration::ZERO).failing("bad.example", FailureKind::Terminal),
        );
        let (_tx, rx) = watch::channel(false);
        let queue = TransactionQueue::new(
            QueueConfig::new("hs.example.org"),
            Arc::clone(&transport) as Arc<dyn FederationTransport>,
            Arc::clone(&hook) as Arc<dyn SentHook>,
            rx,
        );
        queue.enqueue_pdu("good.example", pdu());
        queue.enqueue_pdu("bad.example", pdu());
        queue.kick("good.example");
        queue.kick("bad.example");
        let done = wait_until(
            || {
                queue.pending_count("good.example") == 0 && queue.pending_count("bad.example") == 0
            },
            Duration::from_secs(5),
        )
        .await;
        assert!(done);
        // Give the good sender a beat to run its hook after the pop.
        wait_until(|| hook.sent.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await;
        assert_eq!(hook.sent.load(Ordering::SeqCst), 1);
    }
}
