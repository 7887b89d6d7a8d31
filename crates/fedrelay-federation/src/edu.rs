// Ephemeral data units and presence formatting.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const EDU_PRESENCE: &str = "m.presence";
pub const EDU_TYPING: &str = "m.typing";
pub const EDU_DIRECT_TO_DEVICE: &str = "m.direct_to_device";
pub const EDU_DEVICE_LIST_UPDATE: &str = "m.device_list_update";

/// An ephemeral data unit bound for one destination.
///
/// `internal_key` and `stream_id` are client-side bookkeeping: the key
/// deduplicates pending EDUs (a re-send replaces the queued one) and the
/// stream id ties device EDUs back to their outbox rows for post-send
/// cleanup. Neither crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EduEvent {
    pub destination: String,
    pub origin: String,
    pub edu_type: String,
    pub content: Value,
    #[serde(skip)]
    pub internal_key: Option<String>,
    #[serde(skip)]
    pub stream_id: Option<i64>,
}

impl EduEvent {
    pub fn new(
        destination: impl Into<String>,
        origin: impl Into<String>,
        edu_type: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            destination: destination.into(),
            origin: origin.into(),
            edu_type: edu_type.into(),
            content,
            internal_key: None,
            stream_id: None,
        }
    }

    pub fn with_internal_key(mut self, key: impl Into<String>) -> Self {
        self.internal_key = Some(key.into());
        self
    }

    pub fn with_stream_id(mut self, stream_id: i64) -> Self {
        self.stream_id = Some(stream_id);
        self
    }
}

/// User presence as mirrored from the presence replication stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceState {
    pub user_id: String,
    pub state: PresenceStatus,
    #[serde(default)]
    pub last_active_ts: i64,
    #[serde(default)]
    pub status_msg: Option<String>,
    #[serde(default)]
    pub currently_active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Unavailable,
}

impl PresenceStatus {
    pub fn as_wire(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Unavailable => "unavailable",
        }
    }
}

/// Format one user's presence into `m.presence` EDU content.
///
/// `last_active_ago` is included only for users that have ever been active,
/// `status_msg` is suppressed for offline users, and `currently_active` only
/// makes sense while online.
pub fn format_presence_content(presence: &PresenceState, now_ms: i64) -> Value {
    let mut entry = json!({
        "user_id": presence.user_id,
        "presence": presence.state.as_wire(),
    });
    let fields = entry.as_object_mut().expect("presence entry object");
    if presence.last_active_ts != 0 {
        fields.insert(
            "last_active_ago".to_string(),
            json!(now_ms - presence.last_active_ts),
        );
    }
    if presence.state != PresenceStatus::Offline {
        if let Some(status_msg) = &presence.status_msg {
            fields.insert("status_msg".to_string(), json!(status_msg));
        }
    }
    if presence.state == PresenceStatus::Online {
        fields.insert(
            "currently_active".to_string(),
            json!(presence.currently_active),
        );
    }
    json!({ "push": [entry] })
}
