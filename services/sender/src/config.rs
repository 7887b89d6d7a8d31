use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;

// Sender service configuration sourced from environment variables, with an
// optional YAML override file on top.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    // Our own server name; the origin on every outbound transaction.
    pub server_name: String,
    // Postgres connection string; absent means the in-memory store.
    pub connection_string: Option<String>,
    // Path to the `ed25519 <version> <seed>` signing key file.
    pub signing_key_path: PathBuf,
    // Replication listener host.
    pub replication_host: String,
    // Replication listener port.
    pub replication_port: u16,
    // Client identifier for the replication NAME handshake.
    pub client_name: String,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Outbound federation client knobs.
    pub client: ClientConfig,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Accept remote certificates that fail verification.
    pub allow_self_signed: bool,
    // Global cap on concurrently in-flight transactions.
    pub max_concurrency: usize,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/fedrelay/config.yml";
const DEFAULT_REPLICATION_PORT: u16 = 9092;
const DEFAULT_CLIENT_NAME: &str = "NETCORESynapseReplication";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONCURRENCY: usize = 100;

/// Everything optional; env and YAML each fill in what they have, then
/// `resolve` enforces the required fields.
#[derive(Debug, Default, Deserialize)]
pub struct PartialConfig {
    server_name: Option<String>,
    connection_string: Option<String>,
    signing_key_path: Option<PathBuf>,
    replication_host: Option<String>,
    replication_port: Option<u16>,
    client_name: Option<String>,
    metrics_bind: Option<String>,
    client: Option<PartialClientConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialClientConfig {
    allow_self_signed: Option<bool>,
    max_concurrency: Option<usize>,
}

impl PartialConfig {
    fn from_env() -> Self {
        Self {
            server_name: std::env::var("FEDRELAY_SERVER_NAME").ok(),
            connection_string: std::env::var("FEDRELAY_CONNECTION_STRING").ok(),
            signing_key_path: std::env::var("FEDRELAY_SIGNING_KEY_PATH")
                .ok()
                .map(PathBuf::from),
            replication_host: std::env::var("FEDRELAY_REPLICATION_HOST").ok(),
            replication_port: std::env::var("FEDRELAY_REPLICATION_PORT")
                .ok()
                .and_then(|value| value.parse().ok()),
            client_name: std::env::var("FEDRELAY_CLIENT_NAME").ok(),
            metrics_bind: std::env::var("FEDRELAY_METRICS_BIND").ok(),
            client: Some(PartialClientConfig {
                allow_self_signed: std::env::var("FEDRELAY_ALLOW_SELF_SIGNED")
                    .ok()
                    .map(|value| matches!(value.as_str(), "1" | "true" | "yes")),
                max_concurrency: std::env::var("FEDRELAY_MAX_CONCURRENCY")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .filter(|value| *value > 0),
            }),
        }
    }

    fn merge(mut self, over: PartialConfig) -> Self {
        if over.server_name.is_some() {
            self.server_name = over.server_name;
        }
        if over.connection_string.is_some() {
            self.connection_string = over.connection_string;
        }
        if over.signing_key_path.is_some() {
            self.signing_key_path = over.signing_key_path;
        }
        if over.replication_host.is_some() {
            self.replication_host = over.replication_host;
        }
        if over.replication_port.is_some() {
            self.replication_port = over.replication_port;
        }
        if over.client_name.is_some() {
            self.client_name = over.client_name;
        }
        if over.metrics_bind.is_some() {
            self.metrics_bind = over.metrics_bind;
        }
        if let Some(client) = over.client {
            let mine = self.client.get_or_insert_with(PartialClientConfig::default);
            if client.allow_self_signed.is_some() {
                mine.allow_self_signed = client.allow_self_signed;
            }
            if let Some(value) = client.max_concurrency {
                if value > 0 {
                    mine.max_concurrency = Some(value);
                }
            }
        }
        self
    }

    pub fn resolve(self) -> Result<SenderConfig> {
        let Some(server_name) = self.server_name else {
            bail!("server_name is required (FEDRELAY_SERVER_NAME)");
        };
        let Some(signing_key_path) = self.signing_key_path else {
            bail!("signing_key_path is required (FEDRELAY_SIGNING_KEY_PATH)");
        };
        let Some(replication_host) = self.replication_host else {
            bail!("replication_host is required (FEDRELAY_REPLICATION_HOST)");
        };
        let metrics_bind = self
            .metrics_bind
            .unwrap_or_else(|| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .context("parse metrics_bind")?;
        let client = self.client.unwrap_or_default();
        Ok(SenderConfig {
            server_name,
            connection_string: self.connection_string,
            signing_key_path,
            replication_host,
            replication_port: self.replication_port.unwrap_or(DEFAULT_REPLICATION_PORT),
            client_name: self
                .client_name
                .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
            metrics_bind,
            client: ClientConfig {
                allow_self_signed: client.allow_self_signed.unwrap_or(false),
                max_concurrency: client.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            },
        })
    }
}

impl SenderConfig {
    /// Environment variables first, then the YAML override file named by
    /// `FEDRELAY_CONFIG` (or the default path, which may be absent).
    pub fn load() -> Result<Self> {
        let base = PartialConfig::from_env();
        let override_path = std::env::var("FEDRELAY_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound && override_path.is_none() => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read sender config: {config_path}"));
            }
        };
        let merged = match contents {
            Some(contents) => {
                let over: PartialConfig = serde_yaml::from_str(&contents)
                    .with_context(|| "parse sender config yaml")?;
                base.merge(over)
            }
            None => base,
        };
        merged.resolve()
    }
}
