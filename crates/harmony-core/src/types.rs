//! Core types for Harmony
//!
//! `ChatMessage` is the rendering-ready projection of a message event. It is
//! produced once, when a message enters a room queue, and never re-derived.

use std::fmt;

use chrono::{TimeZone, Utc};
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, as used by `origin_server_ts`.
pub type Millis = i64;

/// Current wall clock time in milliseconds.
pub fn now_millis() -> Millis {
    Utc::now().timestamp_millis()
}

/// Which of a room's two queues a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Delivered by the sync stream, drained oldest first
    Live,
    /// Fetched by backward pagination, drained newest first
    Backfill,
}

/// Where a rendered message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageOrigin {
    Live,
    Backfill,
    /// Optimistic rendering of a message we sent, not yet confirmed
    LocalEcho,
}

impl From<QueueKind> for MessageOrigin {
    fn from(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Live => MessageOrigin::Live,
            QueueKind::Backfill => MessageOrigin::Backfill,
        }
    }
}

/// Severity of a system line printed into a chat view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pagination direction for `/messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Backward => "b",
            Direction::Forward => "f",
        }
    }
}

/// Parameters of a password login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub server_url: String,
    /// As typed by the user; normalized by the account registry
    pub user: String,
    pub password: String,
    pub device_name: Option<String>,
    /// Persist the credentials for the next start
    pub remember: bool,
}

/// Logical identity of a message for local-echo reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EchoKey {
    pub sender: OwnedUserId,
    pub room_id: OwnedRoomId,
    pub html: String,
}

/// Rendering-ready chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `None` while a local echo is unconfirmed
    pub event_id: Option<OwnedEventId>,
    pub sender: OwnedUserId,
    pub room_id: OwnedRoomId,
    /// Account that received (or sent) the message
    pub receiver: OwnedUserId,
    /// Sanitized, link-ified HTML
    pub html: String,
    /// Plain text fallback
    pub body: String,
    pub timestamp: Millis,
    pub origin: MessageOrigin,
    /// Client transaction id, round-tripped through the send call
    pub transaction_id: Option<String>,
}

impl ChatMessage {
    pub fn echo_key(&self) -> EchoKey {
        EchoKey {
            sender: self.sender.clone(),
            room_id: self.room_id.clone(),
            html: self.html.clone(),
        }
    }

    /// Sent by the account displaying it.
    pub fn is_own(&self) -> bool {
        self.sender == self.receiver
    }

    /// CSS class of the rendered block.
    pub fn html_class(&self) -> &'static str {
        if self.is_own() {
            "own-message"
        } else {
            "message"
        }
    }

    /// `HH:MM:SS` in UTC.
    pub fn time_label(&self) -> String {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .map(|dt| dt.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "??:??:??".to_owned())
    }
}
