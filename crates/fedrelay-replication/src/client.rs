// Long-lived replication TCP client.
use bytes::BytesMut;
use fedrelay_wire::{Command, LineDecoder, BATCH_POSITION};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::registry::{RawUpdate, StreamRegistry};
use crate::{Error, Result};

/// Connection lifecycle, in order. `Ready` is entered on the first message
/// from the server and is the only state in which keepalives are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connected,
    Named,
    Ready,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub host: String,
    pub port: u16,
    /// Client identifier sent in the `NAME` handshake.
    pub client_name: String,
    pub ping_interval: Duration,
}

impl ReplicationConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_name: "NETCORESynapseReplication".to_string(),
            ping_interval: Duration::from_secs(5),
        }
    }
}

/// A stream to request at connect time. `position` follows the wire rules:
/// a concrete cursor, or `LATEST_POSITION` for "latest".
#[derive(Debug, Clone)]
pub struct StreamSubscription {
    pub stream: String,
    pub position: String,
}

impl StreamSubscription {
    pub fn new(stream: impl Into<String>, position: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            position: position.into(),
        }
    }
}

/// One connection attempt's worth of replication client.
///
/// `run` drives a single connection to completion; the owner decides whether
/// and when to reconnect (and with which positions), so the durable cursor
/// survives connection churn.
pub struct ReplicationClient {
    config: ReplicationConfig,
    registry: Arc<StreamRegistry>,
    state: watch::Sender<ConnectionState>,
}

impl ReplicationClient {
    pub fn new(config: ReplicationConfig, registry: Arc<StreamRegistry>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            registry,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect, subscribe, and pump updates until the connection dies, the
    /// server reports an error, or shutdown is signaled.
    pub async fn run(
        &self,
        subscriptions: Vec<StreamSubscription>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.set_state(ConnectionState::Resolving);
        let endpoint = format!("{}:{}", self.config.host, self.config.port);
        let stream = match TcpStream::connect(&endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(err.into());
            }
        };
        self.set_state(ConnectionState::Connected);
        let (mut reader, mut writer) = stream.into_split();

        let result = async {
            write_command(
                &mut writer,
                &Command::Name {
                    client: self.config.client_name.clone(),
                },
            )
            .await?;
            self.set_state(ConnectionState::Named);
            for subscription in &subscriptions {
                write_command(
                    &mut writer,
                    &Command::Replicate {
                        stream: subscription.stream.clone(),
                        position: subscription.position.clone(),
                    },
                )
                .await?;
            }

            let mut decoder = LineDecoder::new();
            let mut pending: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
            let mut read_buf = BytesMut::with_capacity(8 * 1024);
            let mut ping = tokio::time::interval(self.config.ping_interval);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so pings start one
            // interval after connect.
            ping.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                    _ = ping.tick() => {
                        if self.state() == ConnectionState::Ready {
                            write_command(
                                &mut writer,
                                &Command::Ping {
                                    payload: unix_millis().to_string(),
                                },
                            )
                            .await?;
                        }
                    }
                    read = reader.read_buf(&mut read_buf) => {
                        match read {
                            Ok(0) => return Err(Error::ConnectionClosed),
                            Ok(_) => {}
                            Err(err) => return Err(err.into()),
                        }
                        decoder.extend(&read_buf);
                        read_buf.clear();
                        while let Some(line) = decoder.next_line()? {
                            self.handle_line(&line, &mut pending)?;
                        }
                    }
                }
            }
        }
        .await;

        self.set_state(ConnectionState::Disconnected);
        result
    }

    fn handle_line(
        &self,
        line: &str,
        pending: &mut HashMap<String, Vec<serde_json::Value>>,
    ) -> Result<()> {
        let command = Command::parse(line)?;
        if self.state() == ConnectionState::Named {
            self.set_state(ConnectionState::Ready);
        }
        match command {
            Command::Server { name } => {
                tracing::info!(server = %name, "replication server identified");
            }
            Command::Ping { payload } => {
                tracing::trace!(payload = %payload, "server keepalive");
            }
            Command::Rdata {
                stream,
                position,
                row,
            } => {
                match serde_json::from_str(&row) {
                    Ok(value) => pending.entry(stream.clone()).or_default().push(value),
                    Err(err) => {
                        metrics::counter!("replication_undecodable_rows_total").increment(1);
                        tracing::error!(
                            stream = %stream,
                            error = %err,
                            "skipping RDATA row that is not valid json"
                        );
                    }
                }
                if position != BATCH_POSITION {
                    let rows = pending.remove(&stream).unwrap_or_default();
                    metrics::counter!("replication_rows_total", "stream" => stream.clone())
                        .increment(rows.len() as u64);
                    self.registry.dispatch(&RawUpdate {
                        stream,
                        position,
                        rows,
                    });
                }
            }
            Command::Position { stream, position } => {
                self.registry.dispatch(&RawUpdate {
                    stream,
                    position,
                    rows: Vec::new(),
                });
            }
            Command::Error { message } => {
                return Err(Error::Remote(message));
            }
            Command::Name { .. } | Command::Replicate { .. } => {
                tracing::warn!(line = %line, "ignoring client-direction command from server");
            }
        }
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() != state {
            tracing::debug!(state = ?state, "replication connection state");
            self.state.send_replace(state);
        }
    }
}

async fn write_command(writer: &mut OwnedWriteHalf, command: &Command) -> Result<()> {
    let mut line = command.encode();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
