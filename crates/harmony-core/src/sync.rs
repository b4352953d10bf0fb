//! Payloads crossing the protocol boundary
//!
//! Events are kept close to their wire shape. Identifiers stay strings here
//! and are validated when the event router classifies the event, so a single
//! bad event cannot fail a whole sync batch.

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Millis;

/// `unsigned` block of a room event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unsigned {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

/// Event as delivered by the homeserver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Unsigned>,
}

impl RawEvent {
    /// String field of `content`, if present.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    pub fn prev_content(&self) -> Option<&Value> {
        self.unsigned.as_ref().and_then(|u| u.prev_content.as_ref())
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.unsigned
            .as_ref()
            .and_then(|u| u.transaction_id.as_deref())
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Compact JSON for diagnostics.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// One joined room in a sync response.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRoom {
    pub room_id: OwnedRoomId,
    /// Token to paginate backward from the start of `timeline`
    pub prev_batch: Option<String>,
    pub state: Vec<RawEvent>,
    pub timeline: Vec<RawEvent>,
    pub ephemeral: Vec<RawEvent>,
}

/// One pending invite in a sync response (stripped state only).
#[derive(Debug, Clone, PartialEq)]
pub struct InvitedRoom {
    pub room_id: OwnedRoomId,
    pub state: Vec<RawEvent>,
}

/// Result of one `/sync` round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    pub next_batch: String,
    pub joined: Vec<JoinedRoom>,
    pub invited: Vec<InvitedRoom>,
    pub left: Vec<OwnedRoomId>,
    pub presence: Vec<RawEvent>,
}

/// Result of one `/messages` page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagesPage {
    #[serde(default)]
    pub chunk: Vec<RawEvent>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}
