// Room event wire shapes.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::Error;

/// Nested signature map: server name -> key id -> base64 signature.
pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

/// Field set shared by both wire versions of a room event.
///
/// `auth_events`, `prev_events`, `hashes` and `unsigned` stay untyped JSON:
/// their inner shape differs between room versions and the sender only ever
/// passes stored event content through, so decoding them would add failure
/// modes without adding information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PduBody {
    pub room_id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub origin_server_ts: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    pub depth: i64,
    pub auth_events: Value,
    pub prev_events: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Value>,
    #[serde(default, skip_serializing_if = "Signatures::is_empty")]
    pub signatures: Signatures,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
}

/// Version-1 event: carries its own `event_id` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PduV1 {
    pub event_id: String,
    #[serde(flatten)]
    pub body: PduBody,
}

/// A room event in one of the two wire shapes.
///
/// Version 2 events have no `event_id` field; their id is derived from the
/// content hash by the receiver. Serialization branches on the variant, so
/// encoding then decoding a `PduEvent` yields the same object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PduEvent {
    V1(PduV1),
    V2(PduBody),
}

impl PduEvent {
    /// Build the wire event for a stored event row.
    ///
    /// `format_version == 1` selects the v1 shape; every other version uses
    /// the v2 shape, dropping a stored `event_id` if the row carries one.
    pub fn from_stored(format_version: i64, mut json: Value) -> crate::Result<Self> {
        if format_version == 1 {
            let event = serde_json::from_value(json)
                .map_err(|err| Error::MalformedEvent(err.to_string()))?;
            return Ok(PduEvent::V1(event));
        }
        if let Some(object) = json.as_object_mut() {
            object.remove("event_id");
        }
        let body =
            serde_json::from_value(json).map_err(|err| Error::MalformedEvent(err.to_string()))?;
        Ok(PduEvent::V2(body))
    }

    pub fn body(&self) -> &PduBody {
        match self {
            PduEvent::V1(event) => &event.body,
            PduEvent::V2(body) => body,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.body().room_id
    }

    pub fn sender(&self) -> &str {
        &self.body().sender
    }
}

/// Server part of a `localpart:server` identifier, if well formed.
pub fn server_part(user_id: &str) -> Option<&str> {
    let (_, server) = user_id.split_once(':')?;
    if server.is_empty() {
        return None;
    }
    Some(server)
}
