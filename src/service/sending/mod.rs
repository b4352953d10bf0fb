// =============================================================================
// Harmony Matrix Client - Sending Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Outbound messages. Each (account, room) pair has exactly one worker task
//   draining its own queue, so a message composed after another one always
//   reaches the server after it.
//
// =============================================================================

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use harmony_core::HarmonyError;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::{errors::ErrorReporter, events::EventRouter};

/// Called with the failure of a send, on the worker task.
pub type SendErrorCallback = Box<dyn FnOnce(HarmonyError) + Send + 'static>;

/// One outbound HTML message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub html: String,
    /// Plain text fallback
    pub body: String,
    /// Client transaction id, echoed back in the event's `unsigned`
    pub txn_id: String,
}

struct Job {
    request: SendRequest,
    on_error: SendErrorCallback,
}

/// (account, room)
type OutgoingKey = (OwnedUserId, OwnedRoomId);

/// Per-room send queues.
pub struct SendQueues {
    router: Arc<EventRouter>,
    errors: Arc<ErrorReporter>,
    workers: StdMutex<HashMap<OutgoingKey, mpsc::UnboundedSender<Job>>>,
}

impl std::fmt::Debug for SendQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueues")
            .field("workers", &self.worker_count())
            .finish()
    }
}

impl SendQueues {
    pub fn new(router: Arc<EventRouter>, errors: Arc<ErrorReporter>) -> Self {
        Self {
            router,
            errors,
            workers: StdMutex::new(HashMap::new()),
        }
    }

    /// Queue `request` behind every earlier send to the same room.
    #[instrument(level = "debug", skip(self, request, on_error), fields(txn_id = %request.txn_id))]
    pub fn send(&self, user_id: &UserId, room_id: &RoomId, request: SendRequest, on_error: SendErrorCallback) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let key = (user_id.to_owned(), room_id.to_owned());

        let job = Job { request, on_error };
        let job = match workers.get(&key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // Worker gone: start a fresh one below
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(
            self.router.clone(),
            self.errors.clone(),
            key.clone(),
            rx,
        ));
        // A fresh receiver cannot be closed yet
        let _ = tx.send(job);
        workers.insert(key, tx);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop the worker of one room after it drained its queue.
    pub fn remove_room(&self, user_id: &UserId, room_id: &RoomId) {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(user_id.to_owned(), room_id.to_owned()));
    }

    /// Stop every worker of `user_id` after they drained their queues.
    pub fn remove_account(&self, user_id: &UserId) -> usize {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let before = workers.len();
        workers.retain(|(user, _), _| user.as_str() != user_id.as_str());
        before - workers.len()
    }
}

async fn worker(
    router: Arc<EventRouter>,
    errors: Arc<ErrorReporter>,
    (user_id, room_id): OutgoingKey,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    debug!("🚀 Send worker started for {} / {}", user_id, room_id);
    while let Some(Job { request, on_error }) = jobs.recv().await {
        let result = match router.session(&user_id) {
            Some(session) => {
                session
                    .send_html(&room_id, &request.html, &request.body, &request.txn_id)
                    .await
            }
            None => Err(HarmonyError::UnknownAccount(user_id.to_string())),
        };

        match result {
            Ok(event_id) => info!("✅ Sent {} to {} as {}", request.txn_id, room_id, event_id),
            Err(e) => {
                errors.report(&format!("send {room_id}"), &e);
                on_error(e);
            }
        }
    }
    debug!("🔧 Send worker stopped for {} / {}", user_id, room_id);
}
