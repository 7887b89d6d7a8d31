// Outbound federation HTTP transport: canonical-JSON bodies, X-Matrix
// request signatures, and the transient/terminal outcome classification the
// retry machinery keys off.
use async_trait::async_trait;
use fedrelay_crypto::{canonical_json, sign_request, ServerKey};
use fedrelay_federation::{FederationTransport, SendError, Transaction};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{redirect::Policy, StatusCode};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FederationHttpConfig {
    // Accept remote certificates that fail verification (self-signed
    // deployments); strict verification otherwise.
    pub allow_self_signed: bool,
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    // "https" in production; tests point at plain-HTTP fake peers.
    pub scheme: String,
}

impl Default for FederationHttpConfig {
    fn default() -> Self {
        Self {
            allow_self_signed: false,
            request_timeout: Duration::from_secs(60),
            pool_idle_timeout: Duration::from_secs(15),
            scheme: "https".to_string(),
        }
    }
}

pub struct MatrixFederationClient {
    client: reqwest::Client,
    key: Arc<ServerKey>,
    scheme: String,
}

impl MatrixFederationClient {
    pub fn new(key: Arc<ServerKey>, config: FederationHttpConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .redirect(Policy::none())
            .no_proxy();
        if config.allow_self_signed {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: builder.build()?,
            key,
            scheme: config.scheme,
        })
    }
}

fn classify_status(destination: &str, status: StatusCode) -> Result<(), SendError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(SendError::transient(
            destination,
            format!("status {status}"),
        ));
    }
    // Remaining 4xx (and anything else unexpected) will not improve with
    // retries of the same body.
    Err(SendError::terminal(
        destination,
        format!("status {status}"),
    ))
}

#[async_trait]
impl FederationTransport for MatrixFederationClient {
    async fn send_transaction(&self, transaction: &Transaction) -> Result<(), SendError> {
        let destination = transaction.destination.as_str();
        let path = format!(
            "/_matrix/federation/v1/send/{}",
            transaction.transaction_id
        );
        let body = serde_json::to_value(transaction).map_err(|err| {
            SendError::terminal(destination, format!("encode transaction: {err}"))
        })?;
        let canonical = canonical_json(&body)
            .map_err(|err| SendError::terminal(destination, format!("canonicalize: {err}")))?;
        let authorization = sign_request(
            &self.key,
            &transaction.origin,
            destination,
            "PUT",
            &path,
            Some(&body),
        )
        .map_err(|err| SendError::terminal(destination, format!("sign request: {err}")))?;

        let url = format!("{}://{}{}", self.scheme, destination, path);
        let response = self
            .client
            .put(url)
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_TYPE, "application/json")
            .body(canonical)
            .send()
            .await
            // Connect refusals, resets, DNS failures and handshake/request
            // timeouts all land here; every one is worth a retry later.
            .map_err(|err| SendError::transient(destination, err.to_string()))?;
        classify_status(destination, response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::http_test::{spawn_axum_with_shutdown, wait_for_listen};
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::put;
    use axum::Router;
    use fedrelay_federation::FailureKind;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn test_client() -> MatrixFederationClient {
        let key = Arc::new(ServerKey::from_seed("a_AAAA", [9u8; 32]));
        let config = FederationHttpConfig {
            scheme: "http".to_string(),
            request_timeout: Duration::from_secs(1),
            ..FederationHttpConfig::default()
        };
        MatrixFederationClient::new(key, config).expect("client")
    }

    fn transaction(destination: &str) -> Transaction {
        Transaction::new("1714000000".to_string(), "hs.example.org", destination)
    }

    async fn serve(router: Router) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, _handle) = spawn_axum_with_shutdown(listener, router);
        wait_for_listen(addr).await.expect("ready");
        (addr, shutdown_tx)
    }

    #[tokio::test]
    async fn put_carries_signature_and_transaction_id() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let router = Router::new().route(
            "/_matrix/federation/v1/send/:txn_id",
            put(
                move |Path(txn_id): Path<String>, headers: HeaderMap, _body: String| {
                    let record = Arc::clone(&record);
                    async move {
                        let auth = headers
                            .get(axum::http::header::AUTHORIZATION)
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        record.lock().expect("seen").push((txn_id, auth));
                        "{}"
                    }
                },
            ),
        );
        let (addr, shutdown_tx) = serve(router).await;

        let client = test_client();
        client
            .send_transaction(&transaction(&addr.to_string()))
            .await
            .expect("send");

        let seen = seen.lock().expect("seen");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "1714000000");
        assert!(seen[0]
            .1
            .starts_with("X-Matrix origin=hs.example.org,key=\"ed25519:a_AAAA\",sig=\""));
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let router = Router::new().fallback(|| async {
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy")
        });
        let (addr, shutdown_tx) = serve(router).await;

        let client = test_client();
        let err = client
            .send_transaction(&transaction(&addr.to_string()))
            .await
            .expect_err("503");
        assert_eq!(err.kind(), FailureKind::Transient);
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn client_errors_are_terminal_except_rate_limits() {
        assert!(classify_status("remote", StatusCode::FORBIDDEN)
            .expect_err("403")
            .kind()
            .eq(&FailureKind::Terminal));
        assert!(classify_status("remote", StatusCode::TOO_MANY_REQUESTS)
            .expect_err("429")
            .kind()
            .eq(&FailureKind::Transient));
        assert!(classify_status("remote", StatusCode::BAD_GATEWAY)
            .expect_err("502")
            .kind()
            .eq(&FailureKind::Transient));
        classify_status("remote", StatusCode::OK).expect("200");
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = test_client();
        let err = client
            .send_transaction(&transaction(&addr.to_string()))
            .await
            .expect_err("refused");
        assert_eq!(err.kind(), FailureKind::Transient);
    }
}
