// Typed subscriptions over raw replication updates.
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One reassembled batch for a stream the subscriber asked for, already
/// decoded to the subscriber's row type. `rows` is empty for a
/// `POSITION`-only update.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamUpdate<T> {
    pub position: String,
    pub rows: Vec<T>,
}

/// An update as it leaves batch reassembly, rows still untyped.
#[derive(Debug, Clone)]
pub struct RawUpdate {
    pub stream: String,
    pub position: String,
    pub rows: Vec<serde_json::Value>,
}

type Dispatcher = Box<dyn Fn(&RawUpdate) -> bool + Send + Sync>;

/// Maps stream names to typed subscriber channels.
///
/// The decoder for a stream is fixed at subscription time by the row type
/// the caller asks for; dispatch stays monomorphic per subscriber with no
/// runtime type tokens. Rows that fail to decode are logged and skipped so
/// one malformed row cannot wedge a stream.
#[derive(Default)]
pub struct StreamRegistry {
    subscribers: Mutex<HashMap<String, Vec<Dispatcher>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<T>(&self, stream: &str) -> mpsc::UnboundedReceiver<StreamUpdate<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher: Dispatcher = Box::new(move |raw| {
            let mut rows = Vec::with_capacity(raw.rows.len());
            for row in &raw.rows {
                match serde_json::from_value::<T>(row.clone()) {
                    Ok(decoded) => rows.push(decoded),
                    Err(err) => {
                        metrics::counter!("replication_undecodable_rows_total").increment(1);
                        tracing::error!(
                            stream = %raw.stream,
                            position = %raw.position,
                            error = %err,
                            "skipping row that does not decode"
                        );
                    }
                }
            }
            tx.send(StreamUpdate {
                position: raw.position.clone(),
                rows,
            })
            .is_ok()
        });
        self.subscribers
            .lock()
            .expect("subscriber map lock")
            .entry(stream.to_string())
            .or_default()
            .push(dispatcher);
        rx
    }

    /// Stream names with at least one live subscriber.
    pub fn streams(&self) -> Vec<String> {
        self.subscribers
            .lock()
            .expect("subscriber map lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Fan an update out to its stream's subscribers, dropping channels
    /// whose receivers have gone away.
    pub fn dispatch(&self, update: &RawUpdate) {
        let mut subscribers = self.subscribers.lock().expect("subscriber map lock");
        if let Some(dispatchers) = subscribers.get_mut(&update.stream) {
            dispatchers.retain(|dispatcher| dispatcher(update));
        }
    }
}
