// Canonical JSON and federation request signing.
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{Map, Value};
use std::path::Path;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("signing key file is malformed: {0}")]
    MalformedKeyFile(String),
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("value cannot be canonicalized: {0}")]
    NonCanonicalValue(String),
    #[error("failed to read signing key: {0}")]
    Io(#[from] std::io::Error),
}

/// Our ed25519 signing key plus its federation key id.
#[derive(Debug)]
pub struct ServerKey {
    key_id: String,
    key: SigningKey,
}

impl ServerKey {
    /// Load a key file of the form `ed25519 <key_id> <unpadded-base64 seed>`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let line = contents
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| Error::MalformedKeyFile("empty key file".to_string()))?;
        let mut fields = line.split_whitespace();
        let algorithm = fields
            .next()
            .ok_or_else(|| Error::MalformedKeyFile("missing algorithm".to_string()))?;
        if algorithm != "ed25519" {
            return Err(Error::UnsupportedAlgorithm(algorithm.to_string()));
        }
        let version = fields
            .next()
            .ok_or_else(|| Error::MalformedKeyFile("missing key version".to_string()))?;
        let seed = fields
            .next()
            .ok_or_else(|| Error::MalformedKeyFile("missing key seed".to_string()))?;
        let seed = STANDARD_NO_PAD
            .decode(seed)
            .map_err(|err| Error::MalformedKeyFile(format!("bad base64 seed: {err}")))?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| Error::MalformedKeyFile("seed must be 32 bytes".to_string()))?;
        Ok(Self {
            key_id: format!("ed25519:{version}"),
            key: SigningKey::from_bytes(&seed),
        })
    }

    #[cfg(any(test, feature = "test-keys"))]
    pub fn from_seed(version: &str, seed: [u8; 32]) -> Self {
        Self {
            key_id: format!("ed25519:{version}"),
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.key.verifying_key()
    }

    /// Sign arbitrary bytes, returning the unpadded-base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        STANDARD_NO_PAD.encode(self.key.sign(message).to_bytes())
    }
}

/// Render canonical JSON: keys sorted, no insignificant whitespace, and no
/// floating-point numbers. `serde_json`'s map keeps keys ordered already;
/// this walks the value to reject the shapes canonical JSON forbids.
pub fn canonical_json(value: &Value) -> Result<String> {
    check_canonical(value)?;
    serde_json::to_string(value).map_err(|err| Error::NonCanonicalValue(err.to_string()))
}

fn check_canonical(value: &Value) -> Result<()> {
    match value {
        Value::Number(number) => {
            if !number.is_i64() && !number.is_u64() {
                return Err(Error::NonCanonicalValue(format!(
                    "non-integer number {number}"
                )));
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(check_canonical),
        Value::Object(fields) => fields.values().try_for_each(check_canonical),
        _ => Ok(()),
    }
}

/// Build the `Authorization: X-Matrix` header value for one federation
/// request. The signature covers the canonical JSON of
/// `{method, uri, origin, destination, content}`, with `content` omitted
/// for bodyless requests.
pub fn sign_request(
    key: &ServerKey,
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> Result<String> {
    let mut request = Map::new();
    if let Some(content) = content {
        request.insert("content".to_string(), content.clone());
    }
    request.insert("destination".to_string(), Value::String(destination.to_string()));
    request.insert("method".to_string(), Value::String(method.to_string()));
    request.insert("origin".to_string(), Value::String(origin.to_string()));
    request.insert("uri".to_string(), Value::String(uri.to_string()));
    let canonical = canonical_json(&Value::Object(request))?;
    let signature = key.sign(canonical.as_bytes());
    Ok(format!(
        "X-Matrix origin={origin},key=\"{key_id}\",sig=\"{signature}\"",
        key_id = key.key_id(),
    ))
}
