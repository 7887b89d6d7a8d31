// Federation sender entry point.
//
// Exit codes: 0 orderly shutdown, 1 fatal configuration error,
// 2 unrecoverable replication-protocol error.
use fedrelay_crypto::ServerKey;
use fedrelay_federation::{FederationTransport, PresenceState, QueueConfig};
use fedrelay_replication::{ReplicationConfig, StreamRegistry};
use fedrelay_sender::config::SenderConfig;
use fedrelay_sender::devices::{DevicePump, DeviceStreamRow};
use fedrelay_sender::events::EventPump;
use fedrelay_sender::http::{FederationHttpConfig, MatrixFederationClient};
use fedrelay_sender::observability::{init_observability, serve_metrics};
use fedrelay_sender::presence::PresencePump;
use fedrelay_sender::replication::{
    run_replication, DEVICE_MESSAGES_STREAM, EVENTS_STREAM, PRESENCE_STREAM,
};
use fedrelay_sender::sender::FederationSender;
use fedrelay_storage::{FederationStore, MemoryStore, PostgresStore};
use std::sync::Arc;
use tokio::sync::watch;

fn main() {
    let runtime = tokio::runtime::Runtime::new().expect("build tokio runtime");
    let code = runtime.block_on(run());
    // Drop the runtime before exiting so background tasks stop cleanly.
    drop(runtime);
    std::process::exit(code);
}

async fn run() -> i32 {
    let prometheus = init_observability("fedrelay-sender");

    let config = match SenderConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration is invalid");
            return 1;
        }
    };
    tracing::info!(server_name = %config.server_name, "federation sender starting");

    let key = match ServerKey::load(&config.signing_key_path) {
        Ok(key) => Arc::new(key),
        Err(err) => {
            tracing::error!(error = %err, path = %config.signing_key_path.display(), "signing key unusable");
            return 1;
        }
    };

    let store: Arc<dyn FederationStore> = match &config.connection_string {
        Some(connection_string) => match PostgresStore::connect(connection_string).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                tracing::error!(error = %err, "database connection failed");
                return 1;
            }
        },
        None => {
            tracing::warn!("no connection string configured; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    tracing::info!(backend = store.backend_name(), "storage ready");

    let transport = match MatrixFederationClient::new(
        Arc::clone(&key),
        FederationHttpConfig {
            allow_self_signed: config.client.allow_self_signed,
            ..FederationHttpConfig::default()
        },
    ) {
        Ok(transport) => Arc::new(transport) as Arc<dyn FederationTransport>,
        Err(err) => {
            tracing::error!(error = %err, "federation http client failed to build");
            return 1;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_task = tokio::spawn(serve_metrics(prometheus, config.metrics_bind));

    let mut queue_config = QueueConfig::new(config.server_name.clone());
    queue_config.max_concurrency = config.client.max_concurrency;
    let sender = FederationSender::new(
        Arc::clone(&store),
        transport,
        queue_config,
        shutdown_rx.clone(),
    );

    let registry = Arc::new(StreamRegistry::new());
    let event_updates = registry.subscribe::<serde_json::Value>(EVENTS_STREAM);
    let presence_updates = registry.subscribe::<PresenceState>(PRESENCE_STREAM);
    let device_updates = registry.subscribe::<DeviceStreamRow>(DEVICE_MESSAGES_STREAM);

    let event_pump = EventPump::new(Arc::clone(&sender), Arc::clone(&store));
    let presence_pump = PresencePump::new(Arc::clone(&sender), Arc::clone(&store));
    let device_pump = DevicePump::new(Arc::clone(&sender));
    let pump_tasks = [
        tokio::spawn(event_pump.run(event_updates, shutdown_rx.clone())),
        tokio::spawn(presence_pump.run(presence_updates, shutdown_rx.clone())),
        tokio::spawn(device_pump.run(device_updates, shutdown_rx.clone())),
    ];

    let replication_config = ReplicationConfig {
        client_name: config.client_name.clone(),
        ..ReplicationConfig::new(config.replication_host.clone(), config.replication_port)
    };
    let mut replication = tokio::spawn(run_replication(
        replication_config,
        registry,
        Arc::clone(&store),
        shutdown_rx,
    ));

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            0
        }
        joined = &mut replication => {
            match joined {
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "replication is unrecoverable");
                    2
                }
                Ok(Ok(())) => 0,
                Err(err) => {
                    tracing::error!(error = %err, "replication task panicked");
                    2
                }
            }
        }
    };

    // Senders finish their in-flight call (bounded by the request timeout)
    // and exit at the next pop; nothing in the queue is persisted.
    let _ = shutdown_tx.send(true);
    for task in pump_tasks {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
    }
    replication.abort();
    metrics_task.abort();
    tracing::info!("federation sender stopped");
    code
}
