// =============================================================================
// Harmony Matrix Client - Test Utils Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   In-memory homeserver and event builders for unit and integration
//   tests. FakeHomeserver implements SessionFactory; its sessions serve
//   queued sync batches, echo sent messages back through sync and page
//   through stored room history.
//
// =============================================================================

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex as StdMutex, Once},
    time::Duration,
};

use async_trait::async_trait;
use harmony_core::{
    now_millis, Direction, HarmonyConfig, HarmonyError, JoinedRoom, MatrixSession, MessagesPage, Millis, RawEvent,
    Result, SessionFactory, SyncBatch, Unsigned,
};
use ruma::{EventId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::debug;

static INIT: Once = Once::new();

/// Initialize tracing for tests (once per process).
pub fn init_test_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    });
}

pub fn test_user_id(local: &str) -> OwnedUserId {
    UserId::parse(format!("@{local}:example.org")).unwrap_or_else(|e| panic!("bad test user {local}: {e}"))
}

pub fn test_room_id(local: &str) -> OwnedRoomId {
    RoomId::parse(format!("!{local}:example.org")).unwrap_or_else(|e| panic!("bad test room {local}: {e}"))
}

/// Configuration writing into `dir`, with short timeouts.
pub fn test_config(dir: &Path) -> HarmonyConfig {
    let mut config = HarmonyConfig {
        accounts_file: dir.join("accounts.json"),
        data_dir: dir.to_path_buf(),
        ..HarmonyConfig::default()
    };
    config.event_log.dir = dir.join("events");
    config.errors.log_file = dir.join("errors.log");
    config.autorun.enabled = false;
    config.autorun.file = dir.join("autorun.json");
    config.login.timeout_secs = 2;
    config.sync.timeout_ms = 50;
    config.sync.reconnect_backoff_ms = 10;
    config.sync.max_reconnect_backoff_ms = 100;
    config.router.enqueue_backoff_ms = 5;
    config.history.poll_interval_ms = 10;
    config.history.start_delay_ms = 10;
    config
}

fn event(value: Value) -> RawEvent {
    serde_json::from_value(value).unwrap_or_else(|e| panic!("bad test event: {e}"))
}

/// Plain `m.text` message.
pub fn message_event(event_id: &str, sender: &UserId, ts: Millis, body: &str) -> RawEvent {
    event(json!({
        "type": "m.room.message",
        "event_id": event_id,
        "sender": sender,
        "origin_server_ts": ts,
        "content": { "msgtype": "m.text", "body": body },
    }))
}

/// `m.room.member` for `target`; `prev` becomes `unsigned.prev_content`.
pub fn member_event(
    event_id: &str,
    sender: &UserId,
    target: &UserId,
    membership: &str,
    display_name: Option<&str>,
    prev: Option<Value>,
) -> RawEvent {
    let mut content = json!({ "membership": membership });
    if let Some(name) = display_name {
        content["displayname"] = json!(name);
    }
    let mut raw = event(json!({
        "type": "m.room.member",
        "event_id": event_id,
        "sender": sender,
        "state_key": target,
        "origin_server_ts": now_millis(),
        "content": content,
    }));
    raw.unsigned = prev.map(|prev_content| Unsigned {
        prev_content: Some(prev_content),
        transaction_id: None,
    });
    raw
}

/// `m.room.name` state event.
pub fn name_event(event_id: &str, sender: &UserId, name: &str) -> RawEvent {
    event(json!({
        "type": "m.room.name",
        "event_id": event_id,
        "sender": sender,
        "state_key": "",
        "origin_server_ts": now_millis(),
        "content": { "name": name },
    }))
}

/// `m.room.canonical_alias` state event.
pub fn alias_event(event_id: &str, sender: &UserId, alias: &str) -> RawEvent {
    event(json!({
        "type": "m.room.canonical_alias",
        "event_id": event_id,
        "sender": sender,
        "state_key": "",
        "origin_server_ts": now_millis(),
        "content": { "alias": alias },
    }))
}

pub fn presence_event(sender: &UserId, presence: &str) -> RawEvent {
    event(json!({
        "type": "m.presence",
        "sender": sender,
        "content": { "presence": presence },
    }))
}

pub fn typing_event(users: &[&UserId]) -> RawEvent {
    event(json!({
        "type": "m.typing",
        "content": { "user_ids": users },
    }))
}

/// Sync batch with a single joined room.
pub fn joined_batch(room_id: &RoomId, prev_batch: Option<&str>, timeline: Vec<RawEvent>) -> SyncBatch {
    SyncBatch {
        joined: vec![JoinedRoom {
            room_id: room_id.to_owned(),
            prev_batch: prev_batch.map(str::to_owned),
            state: Vec::new(),
            timeline,
            ephemeral: Vec::new(),
        }],
        ..SyncBatch::default()
    }
}

/// A message accepted by [`FakeSession::send_html`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub sender: OwnedUserId,
    pub room_id: OwnedRoomId,
    pub html: String,
    pub body: String,
    pub txn_id: String,
    pub event_id: OwnedEventId,
}

/// One display name change accepted by [`FakeHomeserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayNameChange {
    pub user_id: OwnedUserId,
    pub name: String,
    /// `None` for a global change
    pub room_id: Option<OwnedRoomId>,
}

#[derive(Debug, Default)]
struct ServerState {
    passwords: HashMap<OwnedUserId, String>,
    unreachable: bool,
    login_delay: Option<Duration>,
    fail_send: bool,
    batches: HashMap<OwnedUserId, VecDeque<SyncBatch>>,
    sync_tokens: u64,
    members: HashMap<OwnedRoomId, BTreeSet<OwnedUserId>>,
    /// Oldest first
    history: HashMap<OwnedRoomId, Vec<RawEvent>>,
    sent: Vec<SentMessage>,
    /// `(txn_id, sender)` → event id, for idempotent retries
    transactions: HashMap<(String, OwnedUserId), OwnedEventId>,
    next_event: u64,
    /// `from` token of every `/messages` request
    messages_requests: Vec<Option<String>>,
    /// Serve at most this many events per page, whatever the limit
    page_cap: Option<u16>,
    messages_delay: Option<Duration>,
    display_names: Vec<DisplayNameChange>,
    logouts: Vec<OwnedUserId>,
}

#[derive(Debug, Default)]
struct Shared {
    state: StdMutex<ServerState>,
    notify: Notify,
}

/// In-memory homeserver.
#[derive(Debug, Clone, Default)]
pub struct FakeHomeserver {
    shared: Arc<Shared>,
}

impl FakeHomeserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        f(&mut self.shared.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn add_user(&self, user_id: &UserId, password: &str) {
        self.with_state(|s| s.passwords.insert(user_id.to_owned(), password.to_owned()));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.with_state(|s| s.unreachable = unreachable);
    }

    pub fn set_login_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.login_delay = delay);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.with_state(|s| s.fail_send = fail);
    }

    /// Members receive messages sent to the room through their sync.
    pub fn join(&self, room_id: &RoomId, user_id: &UserId) {
        self.with_state(|s| s.members.entry(room_id.to_owned()).or_default().insert(user_id.to_owned()));
    }

    /// Queue a batch for the next sync of `user_id`.
    pub fn push_batch(&self, user_id: &UserId, batch: SyncBatch) {
        self.with_state(|s| s.batches.entry(user_id.to_owned()).or_default().push_back(batch));
        self.shared.notify.notify_waiters();
    }

    /// Room history served by `/messages`, oldest first.
    pub fn set_history(&self, room_id: &RoomId, events: Vec<RawEvent>) {
        self.with_state(|s| s.history.insert(room_id.to_owned(), events));
    }

    /// Cap history pages below the requested limit, as visibility filtering does.
    pub fn set_page_cap(&self, cap: Option<u16>) {
        self.with_state(|s| s.page_cap = cap);
    }

    pub fn set_messages_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.messages_delay = delay);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.with_state(|s| s.sent.clone())
    }

    /// Number of `/messages` requests served.
    pub fn messages_calls(&self) -> usize {
        self.with_state(|s| s.messages_requests.len())
    }

    /// `from` tokens of the `/messages` requests, in order.
    pub fn messages_tokens(&self) -> Vec<Option<String>> {
        self.with_state(|s| s.messages_requests.clone())
    }

    pub fn display_names(&self) -> Vec<DisplayNameChange> {
        self.with_state(|s| s.display_names.clone())
    }

    pub fn logouts(&self) -> Vec<OwnedUserId> {
        self.with_state(|s| s.logouts.clone())
    }

    /// A logged-in session without going through the factory.
    pub fn session(&self, user_id: &UserId) -> Arc<dyn MatrixSession> {
        Arc::new(FakeSession {
            user_id: user_id.to_owned(),
            homeserver: format!("https://{}", user_id.server_name()),
            server: self.clone(),
        })
    }

    fn pop_batch(&self, user_id: &UserId) -> Option<SyncBatch> {
        self.with_state(|s| {
            let mut batch = s.batches.get_mut(user_id)?.pop_front()?;
            s.sync_tokens += 1;
            batch.next_batch = format!("t{}", s.sync_tokens);
            Some(batch)
        })
    }
}

#[async_trait]
impl SessionFactory for FakeHomeserver {
    async fn login(
        &self,
        server_url: &str,
        user_id: &UserId,
        password: &str,
        _device_name: &str,
    ) -> Result<Arc<dyn MatrixSession>> {
        let (unreachable, delay) = self.with_state(|s| (s.unreachable, s.login_delay));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(HarmonyError::Unreachable(format!("{server_url} is down")));
        }
        let known = self.with_state(|s| s.passwords.get(user_id).cloned());
        if known.as_deref() != Some(password) {
            return Err(HarmonyError::Auth(format!("M_FORBIDDEN invalid password for {user_id}")));
        }
        Ok(Arc::new(FakeSession {
            user_id: user_id.to_owned(),
            homeserver: server_url.to_owned(),
            server: self.clone(),
        }))
    }
}

/// Session of [`FakeHomeserver`].
#[derive(Debug)]
pub struct FakeSession {
    user_id: OwnedUserId,
    homeserver: String,
    server: FakeHomeserver,
}

fn history_token(index: usize) -> String {
    format!("h{index}")
}

fn parse_history_token(token: &str) -> Result<usize> {
    token
        .strip_prefix('h')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| HarmonyError::Protocol(format!("unknown pagination token {token:?}")))
}

#[async_trait]
impl MatrixSession for FakeSession {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn homeserver(&self) -> &str {
        &self.homeserver
    }

    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncBatch> {
        let notified = self.server.shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(batch) = self.server.pop_batch(&self.user_id) {
            return Ok(batch);
        }
        if tokio::time::timeout(timeout, notified).await.is_ok() {
            if let Some(batch) = self.server.pop_batch(&self.user_id) {
                return Ok(batch);
            }
        }
        Ok(SyncBatch {
            next_batch: since.unwrap_or("t0").to_owned(),
            ..SyncBatch::default()
        })
    }

    async fn send_html(&self, room_id: &RoomId, html: &str, body: &str, txn_id: &str) -> Result<OwnedEventId> {
        let (event_id, raw, recipients) = self.server.with_state(|s| {
            if s.fail_send {
                return Err(HarmonyError::Network("send rejected".to_owned()));
            }
            let key = (txn_id.to_owned(), self.user_id.clone());
            if let Some(event_id) = s.transactions.get(&key) {
                return Ok((event_id.clone(), None, Vec::new()));
            }

            s.next_event += 1;
            let event_id = EventId::parse(format!("$sent{}:example.org", s.next_event))?;
            let mut raw = event(json!({
                "type": "m.room.message",
                "event_id": event_id,
                "sender": self.user_id,
                "origin_server_ts": now_millis(),
                "content": {
                    "msgtype": "m.text",
                    "body": body,
                    "format": "org.matrix.custom.html",
                    "formatted_body": html,
                },
            }));
            s.history.entry(room_id.to_owned()).or_default().push(raw.clone());
            s.transactions.insert(key, event_id.clone());
            s.sent.push(SentMessage {
                sender: self.user_id.clone(),
                room_id: room_id.to_owned(),
                html: html.to_owned(),
                body: body.to_owned(),
                txn_id: txn_id.to_owned(),
                event_id: event_id.clone(),
            });

            let mut recipients: Vec<OwnedUserId> = s
                .members
                .get(room_id)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default();
            if !recipients.contains(&self.user_id) {
                recipients.push(self.user_id.clone());
            }
            // Only the sender's own sync carries the transaction id
            raw.unsigned = Some(Unsigned {
                prev_content: None,
                transaction_id: Some(txn_id.to_owned()),
            });
            Ok((event_id, Some(raw), recipients))
        })?;

        if let Some(raw) = raw {
            for recipient in recipients {
                let mut delivered = raw.clone();
                if recipient != self.user_id {
                    delivered.unsigned = None;
                }
                self.server
                    .push_batch(&recipient, joined_batch(room_id, None, vec![delivered]));
            }
        }
        debug!("🔧 Fake homeserver accepted {} from {}", event_id, self.user_id);
        Ok(event_id)
    }

    async fn room_messages(
        &self,
        room_id: &RoomId,
        from: Option<&str>,
        dir: Direction,
        limit: u16,
    ) -> Result<MessagesPage> {
        if dir != Direction::Backward {
            return Err(HarmonyError::Protocol("only backward pagination is served".to_owned()));
        }
        if let Some(delay) = self.server.with_state(|s| s.messages_delay) {
            tokio::time::sleep(delay).await;
        }
        self.server.with_state(|s| {
            s.messages_requests.push(from.map(str::to_owned));
            let history = s.history.get(room_id).map(Vec::as_slice).unwrap_or_default();
            let upper = match from {
                Some(token) => parse_history_token(token)?.min(history.len()),
                None => history.len(),
            };
            let served = s.page_cap.map_or(limit, |cap| cap.min(limit));
            let lower = upper.saturating_sub(usize::from(served));
            Ok(MessagesPage {
                chunk: history[lower..upper].iter().rev().cloned().collect(),
                start: Some(history_token(upper)),
                end: (lower > 0).then(|| history_token(lower)),
            })
        })
    }

    async fn set_display_name(&self, name: &str, room_id: Option<&RoomId>) -> Result<()> {
        self.server.with_state(|s| {
            if s.unreachable {
                return Err(HarmonyError::Network("homeserver unreachable".to_owned()));
            }
            s.display_names.push(DisplayNameChange {
                user_id: self.user_id.clone(),
                name: name.to_owned(),
                room_id: room_id.map(ToOwned::to_owned),
            });
            Ok(())
        })
    }

    async fn logout(&self) -> Result<()> {
        self.server.with_state(|s| s.logouts.push(self.user_id.clone()));
        Ok(())
    }
}
