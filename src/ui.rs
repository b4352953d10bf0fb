// =============================================================================
// Harmony Matrix Client - UI Channel Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The only path from background tasks to the UI. Every notification,
//   render update and user-visible error is a message on one bounded channel
//   drained by a single consumer loop on the UI-owning task.
//
// =============================================================================

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::service::display::document::{RenderedBlock, Viewport};

/// Typed notifications published by the account registry and event router.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NewAccount {
        user_id: OwnedUserId,
    },
    /// Posted before the account is torn down
    AccountGone {
        user_id: OwnedUserId,
    },
    AccountChange {
        user_id: OwnedUserId,
        display_name: String,
        avatar_url: Option<String>,
    },
    LoginFailed {
        user_id: String,
        kind: &'static str,
        message: String,
    },
    NewRoom {
        user_id: OwnedUserId,
        room_id: OwnedRoomId,
    },
    RoomRename {
        user_id: OwnedUserId,
        room_id: OwnedRoomId,
        name: String,
    },
    LeftRoom {
        user_id: OwnedUserId,
        room_id: OwnedRoomId,
    },
    NewInvite {
        user_id: OwnedUserId,
        room_id: OwnedRoomId,
        invited_by: Option<OwnedUserId>,
        display_name: String,
        name: Option<String>,
        alias: Option<String>,
    },
    NewMessage {
        user_id: OwnedUserId,
        room_id: OwnedRoomId,
        event_id: OwnedEventId,
        sender: OwnedUserId,
    },
    Presence {
        user_id: OwnedUserId,
        sender: String,
        presence: String,
        status_msg: Option<String>,
    },
    Ephemeral {
        user_id: OwnedUserId,
        room_id: OwnedRoomId,
        event_type: String,
        content: Value,
    },
}

/// Incremental change to one chat view's document.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderUpdate {
    Inserted {
        index: usize,
        block: RenderedBlock,
        /// Block after the insertion whose header or separator changed
        regrouped: Option<(usize, RenderedBlock)>,
        viewport: Viewport,
    },
    /// A local echo got its server event; no new block
    Confirmed {
        index: usize,
        event_id: OwnedEventId,
    },
    Scrolled {
        viewport: Viewport,
    },
    HistoryExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Notification(Notification),
    Render {
        user_id: OwnedUserId,
        room_id: OwnedRoomId,
        update: RenderUpdate,
    },
    Error {
        scope: String,
        kind: &'static str,
        message: String,
    },
}

/// Cloneable producer half.
#[derive(Debug, Clone)]
pub struct UiSender {
    tx: mpsc::Sender<UiEvent>,
}

/// Single consumer half, owned by the UI loop.
#[derive(Debug)]
pub struct UiReceiver {
    rx: mpsc::Receiver<UiEvent>,
}

/// Create the UI channel.
pub fn channel(capacity: usize) -> (UiSender, UiReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (UiSender { tx }, UiReceiver { rx })
}

impl UiSender {
    /// Post an event, waiting for room in the channel.
    ///
    /// A closed channel means the UI is shutting down; the event is dropped.
    pub async fn post(&self, event: UiEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("🔧 UI channel closed, dropping event");
        }
    }

    pub async fn notify(&self, notification: Notification) {
        self.post(UiEvent::Notification(notification)).await;
    }

    /// Post without waiting. Returns false when the event was dropped.
    pub fn try_post(&self, event: UiEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("⚠️ UI channel full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl UiReceiver {
    pub async fn recv(&mut self) -> Option<UiEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<UiEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Run `handler` for every event until all senders are gone.
    pub async fn run<F>(mut self, mut handler: F)
    where
        F: FnMut(UiEvent),
    {
        while let Some(event) = self.rx.recv().await {
            handler(event);
        }
        debug!("🔧 UI loop finished");
    }
}
