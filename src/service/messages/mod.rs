// =============================================================================
// Harmony Matrix Client - Message Queue Store Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   One pair of priority queues per (account, room): live messages drain
//   oldest first, backfilled history drains newest first. Messages are
//   converted to their rendered form when they are queued.
//
// Features:
//   • Explicit ordering key with event-id and arrival tie-breaks
//   • Blocking pop for the display loops, try_pop for polling
//   • Bounded retry when a message races ahead of its room's queue
//
// =============================================================================

mod convert;

pub use convert::to_chat_message;

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use harmony_core::{config::RouterConfig, ChatMessage, Millis, QueueKind, RawEvent, Result};
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

type QueueId = (OwnedUserId, OwnedRoomId);

/// Position of a message in its queue.
///
/// `BinaryHeap` pops the greatest key, so live keys compare reversed on
/// timestamp (oldest pops first) while backfill keys compare forward (newest
/// pops first). Equal timestamps fall back to the event id, in the same
/// direction as the timestamp, and finally to arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueKey {
    pub kind: QueueKind,
    pub timestamp: Millis,
    pub event_id: String,
    pub seq: u64,
}

impl QueueKey {
    /// Signed priority: the timestamp for live messages, its negation for
    /// history, so draining in ascending priority matches request order.
    pub fn priority(&self) -> Millis {
        match self.kind {
            QueueKind::Live => self.timestamp,
            QueueKind::Backfill => -self.timestamp,
        }
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority()
            .cmp(&self.priority())
            .then_with(|| match self.kind {
                QueueKind::Live => other.event_id.cmp(&self.event_id),
                QueueKind::Backfill => self.event_id.cmp(&other.event_id),
            })
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Queued {
    key: QueueKey,
    message: ChatMessage,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Both queues of one room. Each kind has a single consumer.
#[derive(Debug, Default)]
pub struct RoomQueue {
    live: StdMutex<BinaryHeap<Queued>>,
    backfill: StdMutex<BinaryHeap<Queued>>,
    live_ready: Notify,
    backfill_ready: Notify,
    closed: AtomicBool,
}

impl RoomQueue {
    fn heap(&self, kind: QueueKind) -> &StdMutex<BinaryHeap<Queued>> {
        match kind {
            QueueKind::Live => &self.live,
            QueueKind::Backfill => &self.backfill,
        }
    }

    fn ready(&self, kind: QueueKind) -> &Notify {
        match kind {
            QueueKind::Live => &self.live_ready,
            QueueKind::Backfill => &self.backfill_ready,
        }
    }

    fn push(&self, key: QueueKey, message: ChatMessage) {
        let kind = key.kind;
        self.heap(kind)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Queued { key, message });
        self.ready(kind).notify_one();
    }

    pub fn try_pop(&self, kind: QueueKind) -> Option<ChatMessage> {
        self.heap(kind)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .map(|q| q.message)
    }

    /// Wait for the next message. `None` once the queue is closed.
    pub async fn pop(&self, kind: QueueKind) -> Option<ChatMessage> {
        loop {
            if let Some(message) = self.try_pop(kind) {
                return Some(message);
            }
            if self.closed.load(AtomicOrdering::Acquire) {
                return None;
            }
            self.ready(kind).notified().await;
        }
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.heap(kind).lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.len(kind) == 0
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.live_ready.notify_one();
        self.backfill_ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }
}

/// All room queues of all accounts.
#[derive(Debug)]
pub struct MessageQueues {
    queues: StdMutex<HashMap<QueueId, Arc<RoomQueue>>>,
    seq: AtomicU64,
    config: RouterConfig,
}

impl MessageQueues {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            queues: StdMutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            config,
        }
    }

    /// Create the queues of a room; a no-op if they exist.
    pub fn create_room(&self, user_id: &UserId, room_id: &RoomId) -> Arc<RoomQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry((user_id.to_owned(), room_id.to_owned()))
            .or_insert_with(|| {
                debug!("🔧 Creating message queues for {} in {}", user_id, room_id);
                Arc::new(RoomQueue::default())
            })
            .clone()
    }

    pub fn queue(&self, user_id: &UserId, room_id: &RoomId) -> Option<Arc<RoomQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user_id.to_owned(), room_id.to_owned()))
            .cloned()
    }

    /// Convert a raw message event and queue it.
    #[instrument(level = "debug", skip(self, raw), fields(event_id = ?raw.event_id))]
    pub async fn enqueue(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        raw: &RawEvent,
        kind: QueueKind,
    ) -> Result<ChatMessage> {
        let message = to_chat_message(user_id, room_id, raw, kind)?;
        self.push(user_id, room_id, message.clone(), kind).await;
        Ok(message)
    }

    /// Queue an already converted message.
    ///
    /// The room's queues normally exist before any message arrives. If they
    /// do not yet, retry with exponential backoff and finally create them.
    pub async fn push(&self, user_id: &UserId, room_id: &RoomId, message: ChatMessage, kind: QueueKind) {
        let key = QueueKey {
            kind,
            timestamp: message.timestamp,
            event_id: message
                .event_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
        };

        let mut delay = Duration::from_millis(self.config.enqueue_backoff_ms);
        for attempt in 0..self.config.enqueue_retries {
            if let Some(queue) = self.queue(user_id, room_id) {
                queue.push(key, message);
                return;
            }
            debug!("🔧 Queue for {} not ready (attempt {}), retrying", room_id, attempt + 1);
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }

        warn!("⚠️ Queue for {} in {} still missing, creating it", user_id, room_id);
        self.create_room(user_id, room_id).push(key, message);
    }

    /// Wait for the next message of a room. `None` if the room has no
    /// queues or they were removed while waiting.
    pub async fn pop(&self, user_id: &UserId, room_id: &RoomId, kind: QueueKind) -> Option<ChatMessage> {
        let queue = self.queue(user_id, room_id)?;
        queue.pop(kind).await
    }

    pub fn try_pop(&self, user_id: &UserId, room_id: &RoomId, kind: QueueKind) -> Option<ChatMessage> {
        self.queue(user_id, room_id)?.try_pop(kind)
    }

    pub fn len(&self, user_id: &UserId, room_id: &RoomId, kind: QueueKind) -> usize {
        self.queue(user_id, room_id).map_or(0, |q| q.len(kind))
    }

    /// Drop a room's queues and wake their consumers.
    pub fn remove_room(&self, user_id: &UserId, room_id: &RoomId) {
        let removed = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(user_id.to_owned(), room_id.to_owned()));
        if let Some(queue) = removed {
            queue.close();
        }
    }

    /// Drop every queue of an account.
    pub fn remove_account(&self, user_id: &UserId) -> usize {
        let removed: Vec<_> = {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<_> = queues
                .keys()
                .filter(|(user, _)| user.as_str() == user_id.as_str())
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| queues.remove(&k)).collect()
        };
        for queue in &removed {
            queue.close();
        }
        removed.len()
    }
}
