// =============================================================================
// Harmony Matrix Client - Event Router Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Receives every protocol event of every logged-in account, drops
//   duplicates and events of accounts that are gone, classifies the rest and
//   turns them into UI notifications and room queue entries.
//
// Architecture:
//   • One sync listener task per account, reconnecting with backoff
//   • Per-account dedup sets behind their own lock
//   • "New room" is published before any message of that room is handed off
//   • Message hand-off runs on a bounded worker pool, never on the listener
//   • Events older than the session start only fill queues and snapshots
//
// =============================================================================

pub mod classify;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex, RwLock},
    time::Duration,
};

use harmony_core::{
    config::SyncConfig, HarmonyError, MatrixSession, Millis, QueueKind, RawEvent, Result, SyncBatch,
};
use ruma::{events::room::member::MembershipState, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, info, instrument, warn};

pub use classify::{classify_room_event, MemberChange, ProtocolEvent};

use super::{
    caches::DisplayNames,
    errors::ErrorReporter,
    event_logger::EventLogger,
    messages::MessageQueues,
    rooms::{computed_name, RoomDirectory},
};
use crate::ui::{Notification, UiSender};

/// Where an event was delivered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Timeline section of a sync response
    Timeline,
    /// State section of a sync response
    State,
    /// Backward pagination
    Backfill,
}

/// What `process_event` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The account is not (or no longer) registered
    Orphaned,
    /// Event id already processed for this account
    Duplicate,
    Handled {
        kind: &'static str,
        historical: bool,
    },
}

struct Registration {
    session: Arc<dyn MatrixSession>,
    session_start: Millis,
    listener: Option<JoinHandle<()>>,
}

/// Shared collaborators of the router.
pub struct RouterDeps {
    pub rooms: Arc<RoomDirectory>,
    pub names: Arc<DisplayNames>,
    pub queues: Arc<MessageQueues>,
    pub ui: UiSender,
    pub errors: Arc<ErrorReporter>,
    pub event_log: Option<EventLogger>,
}

/// Event router.
pub struct EventRouter {
    registrations: RwLock<HashMap<OwnedUserId, Registration>>,
    seen: StdMutex<HashMap<OwnedUserId, HashSet<String>>>,
    rooms: Arc<RoomDirectory>,
    names: Arc<DisplayNames>,
    queues: Arc<MessageQueues>,
    ui: UiSender,
    errors: Arc<ErrorReporter>,
    event_log: Option<EventLogger>,
    handoff: Arc<Semaphore>,
    sync: SyncConfig,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("accounts", &self.accounts())
            .field("handoff_available", &self.handoff.available_permits())
            .finish()
    }
}

fn invite_marker(room_id: &RoomId) -> String {
    format!("invite:{room_id}")
}

impl EventRouter {
    pub fn new(deps: RouterDeps, handoff_workers: usize, sync: SyncConfig) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            seen: StdMutex::new(HashMap::new()),
            rooms: deps.rooms,
            names: deps.names,
            queues: deps.queues,
            ui: deps.ui,
            errors: deps.errors,
            event_log: deps.event_log,
            handoff: Arc::new(Semaphore::new(handoff_workers.max(1))),
            sync,
        }
    }

    /// Register an account and start its sync listener.
    #[instrument(level = "debug", skip(self, session), fields(user_id = %session.user_id()))]
    pub fn register(self: &Arc<Self>, session: Arc<dyn MatrixSession>, session_start: Millis) {
        self.attach(session.clone(), session_start);

        let router = Arc::clone(self);
        let user_id = session.user_id().to_owned();
        let handle = tokio::spawn(async move { router.listen(session).await });

        let mut registrations = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        match registrations.get_mut(&user_id) {
            Some(registration) => registration.listener = Some(handle),
            // Unregistered before the listener got stored
            None => handle.abort(),
        }
    }

    /// Register an account without a listener; events are pushed in through
    /// `process_*`.
    pub fn attach(&self, session: Arc<dyn MatrixSession>, session_start: Millis) {
        let user_id = session.user_id().to_owned();
        info!("🔧 Registering {} with the event router", user_id);
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user_id.clone())
            .or_default();
        let previous = self
            .registrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                user_id,
                Registration {
                    session,
                    session_start,
                    listener: None,
                },
            );
        if let Some(listener) = previous.and_then(|r| r.listener) {
            listener.abort();
        }
    }

    /// Forget an account: stop its listener and purge its dedup set, queues,
    /// room snapshots and cached names. Late events become `Orphaned`.
    #[instrument(level = "debug", skip(self))]
    pub fn unregister(&self, user_id: &UserId) {
        let registration = self
            .registrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);
        if let Some(listener) = registration.and_then(|r| r.listener) {
            listener.abort();
        }
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).remove(user_id);
        let queues = self.queues.remove_account(user_id);
        let rooms = self.rooms.remove_account(user_id);
        self.names.remove_account(user_id);
        info!("✅ Unregistered {} ({} rooms, {} queues)", user_id, rooms, queues);
    }

    pub fn is_registered(&self, user_id: &UserId) -> bool {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(user_id)
    }

    pub fn accounts(&self) -> Vec<OwnedUserId> {
        let mut ids: Vec<_> = self
            .registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn session(&self, user_id: &UserId) -> Option<Arc<dyn MatrixSession>> {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .map(|r| r.session.clone())
    }

    fn session_start(&self, user_id: &UserId) -> Option<Millis> {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .map(|r| r.session_start)
    }

    /// Record `key` as seen. `None` if the account has no dedup set.
    fn mark_seen(&self, user_id: &UserId, key: String) -> Option<bool> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(user_id)
            .map(|set| set.insert(key))
    }

    fn forget_seen(&self, user_id: &UserId, key: &str) {
        if let Some(set) = self.seen.lock().unwrap_or_else(|e| e.into_inner()).get_mut(user_id) {
            set.remove(key);
        }
    }

    /// Route one room event of `user_id`.
    #[instrument(level = "debug", skip(self, raw), fields(event_id = ?raw.event_id, event_type = %raw.event_type))]
    pub async fn process_event(
        self: &Arc<Self>,
        user_id: &UserId,
        room_id: &RoomId,
        raw: RawEvent,
        origin: EventOrigin,
    ) -> Result<Outcome> {
        let Some(session_start) = self.session_start(user_id) else {
            debug!("🔧 Dropping event for unregistered account {}", user_id);
            return Ok(Outcome::Orphaned);
        };
        let event_id = raw
            .event_id
            .clone()
            .ok_or_else(|| HarmonyError::MalformedEvent(format!("room event without event_id: {}", raw.payload())))?;

        let first_seen = match self.mark_seen(user_id, event_id) {
            None => return Ok(Outcome::Orphaned),
            Some(first) => first,
        };
        // A reopened view pages through history again; views skip ids they already show
        if !first_seen && origin != EventOrigin::Backfill {
            return Ok(Outcome::Duplicate);
        }

        if self.rooms.announce(user_id, room_id) {
            self.queues.create_room(user_id, room_id);
            self.ui
                .notify(Notification::NewRoom {
                    user_id: user_id.to_owned(),
                    room_id: room_id.to_owned(),
                })
                .await;
        }

        if let (true, Some(log)) = (first_seen, &self.event_log) {
            log.log(room_id, &raw);
        }

        let historical = origin == EventOrigin::Backfill
            || raw.origin_server_ts.is_some_and(|ts| ts < session_start);
        let event = classify_room_event(room_id, raw)?;
        let kind = event.label();
        self.dispatch(user_id, event, origin, historical).await;

        if self.discard_if_gone(user_id, room_id) {
            return Ok(Outcome::Orphaned);
        }
        Ok(Outcome::Handled { kind, historical })
    }

    /// Undo room state written for an account that was unregistered while
    /// the event was being processed. Returns true if the account is gone.
    fn discard_if_gone(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        if self.is_registered(user_id) {
            return false;
        }
        self.rooms.remove_room(user_id, room_id);
        self.queues.remove_room(user_id, room_id);
        self.names.remove_room(user_id, room_id);
        true
    }

    async fn dispatch(self: &Arc<Self>, user_id: &UserId, event: ProtocolEvent, origin: EventOrigin, historical: bool) {
        match event {
            ProtocolEvent::Message { room_id, event } => {
                let kind = if origin == EventOrigin::Backfill {
                    QueueKind::Backfill
                } else {
                    QueueKind::Live
                };
                self.hand_off(user_id, room_id, event, kind, !historical);
            }
            // History carries older state than what the snapshot already has
            ProtocolEvent::Rename { .. } | ProtocolEvent::Member { .. } if origin == EventOrigin::Backfill => {}
            ProtocolEvent::Rename { room_id, rename } => {
                let before = self.names.room_name(user_id, &room_id);
                if self.rooms.apply_rename(user_id, &room_id, &rename) {
                    self.names.invalidate_room(user_id, &room_id);
                    self.announce_rename(user_id, &room_id, before, historical).await;
                }
            }
            ProtocolEvent::Member { room_id, change } => {
                self.apply_member_change(user_id, &room_id, change, historical).await;
            }
            ProtocolEvent::State { room_id, event_type } | ProtocolEvent::Ignored { room_id, event_type } => {
                debug!("🔧 {} in {} needs no rendering", event_type, room_id);
            }
            ProtocolEvent::Invite { room_id, state } => self.handle_invite(user_id, room_id, state).await,
            ProtocolEvent::Leave { room_id } => self.handle_leave(user_id, &room_id).await,
            ProtocolEvent::Presence {
                sender,
                presence,
                status_msg,
            } => {
                self.ui
                    .notify(Notification::Presence {
                        user_id: user_id.to_owned(),
                        sender,
                        presence,
                        status_msg,
                    })
                    .await;
            }
            ProtocolEvent::Ephemeral {
                room_id,
                event_type,
                content,
            } => {
                self.ui
                    .notify(Notification::Ephemeral {
                        user_id: user_id.to_owned(),
                        room_id,
                        event_type,
                        content,
                    })
                    .await;
            }
        }
    }

    async fn announce_rename(&self, user_id: &UserId, room_id: &RoomId, before: String, historical: bool) {
        let after = self.names.room_name(user_id, room_id);
        if historical || before == after {
            return;
        }
        self.ui
            .notify(Notification::RoomRename {
                user_id: user_id.to_owned(),
                room_id: room_id.to_owned(),
                name: after,
            })
            .await;
    }

    async fn apply_member_change(&self, user_id: &UserId, room_id: &RoomId, change: MemberChange, historical: bool) {
        let before = self.names.room_name(user_id, room_id);
        let member_id = change.user_id.clone();
        let updated = self
            .rooms
            .apply_member(user_id, room_id, &member_id, change.member.clone());
        if !updated {
            return;
        }

        self.names.invalidate_user(user_id, room_id, &member_id);
        let named_by_members = self
            .rooms
            .with_room(user_id, room_id, |info| info.explicit_name().is_none())
            .unwrap_or(true);
        if named_by_members {
            self.names.invalidate_room(user_id, room_id);
        }

        if historical {
            return;
        }

        if change.changed
            && change.member.membership == MembershipState::Join
            && self.is_registered(&member_id)
        {
            self.ui
                .notify(Notification::AccountChange {
                    display_name: change
                        .member
                        .display_name
                        .clone()
                        .unwrap_or_else(|| member_id.to_string()),
                    avatar_url: change.member.avatar_url.clone(),
                    user_id: member_id,
                })
                .await;
        }
        self.announce_rename(user_id, room_id, before, historical).await;
    }

    /// Queue a message on the hand-off pool so the listener never waits on
    /// conversion or a slow consumer.
    fn hand_off(self: &Arc<Self>, user_id: &UserId, room_id: OwnedRoomId, raw: RawEvent, kind: QueueKind, notify: bool) {
        let router = Arc::clone(self);
        let user_id = user_id.to_owned();
        let slots = Arc::clone(&self.handoff);

        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            if !router.is_registered(&user_id) {
                debug!("🔧 {} logged out before hand-off, dropping message", user_id);
                return;
            }

            match router.queues.enqueue(&user_id, &room_id, &raw, kind).await {
                Ok(message) => {
                    if !router.is_registered(&user_id) {
                        // Logged out while the message was being queued
                        router.queues.remove_account(&user_id);
                        return;
                    }
                    if let (true, Some(event_id)) = (notify, message.event_id) {
                        router
                            .ui
                            .notify(Notification::NewMessage {
                                user_id,
                                room_id,
                                event_id,
                                sender: message.sender,
                            })
                            .await;
                    }
                }
                Err(e) => router.report_event_error("router.handoff", &e),
            }
        });
    }

    /// Unsupported events are expected in real rooms and only logged; every
    /// other failure goes to the error reporter.
    pub fn report_event_error(&self, scope: &str, err: &HarmonyError) {
        match err {
            HarmonyError::UnsupportedEvent { .. } => warn!("⚠️ [{}] {}", scope, err),
            _ => self.errors.report(scope, err),
        }
    }

    /// Pending invite of `user_id` to `room_id`.
    pub async fn process_invite(self: &Arc<Self>, user_id: &UserId, room_id: OwnedRoomId, state: Vec<RawEvent>) -> Outcome {
        match self.mark_seen(user_id, invite_marker(&room_id)) {
            None => return Outcome::Orphaned,
            Some(false) => return Outcome::Duplicate,
            Some(true) => {}
        }
        self.dispatch(user_id, ProtocolEvent::Invite { room_id, state }, EventOrigin::State, false)
            .await;
        Outcome::Handled {
            kind: "invite",
            historical: false,
        }
    }

    async fn handle_invite(&self, user_id: &UserId, room_id: OwnedRoomId, state: Vec<RawEvent>) {
        let mut name = None;
        let mut alias = None;
        let mut members: HashMap<String, Option<String>> = HashMap::new();
        for event in &state {
            match event.event_type.as_str() {
                "m.room.name" => name = event.content_str("name").map(str::to_owned),
                "m.room.canonical_alias" => alias = event.content_str("alias").map(str::to_owned),
                "m.room.member" => {
                    let Some(member) = event.state_key.clone() else { continue };
                    if member == user_id.as_str() {
                        continue;
                    }
                    match event.content_str("membership") {
                        Some("join") | Some("invite") => {
                            members.insert(member, event.content_str("displayname").map(str::to_owned));
                        }
                        _ => {
                            members.remove(&member);
                        }
                    }
                }
                _ => {}
            }
        }
        let name = name.filter(|n| !n.trim().is_empty());
        let alias = alias.filter(|a| !a.trim().is_empty());

        let display_name = name.clone().or_else(|| alias.clone()).unwrap_or_else(|| {
            computed_name(
                members
                    .into_iter()
                    .map(|(id, display)| display.filter(|d| !d.trim().is_empty()).unwrap_or(id))
                    .collect(),
            )
        });
        let invited_by = state
            .last()
            .and_then(|e| e.sender.as_deref())
            .and_then(|s| UserId::parse(s).ok());

        info!("📨 {} invited to {} ({})", user_id, room_id, display_name);
        self.ui
            .notify(Notification::NewInvite {
                user_id: user_id.to_owned(),
                room_id,
                invited_by,
                display_name,
                name,
                alias,
            })
            .await;
    }

    /// `user_id` left (or was removed from) `room_id`.
    pub async fn process_leave(self: &Arc<Self>, user_id: &UserId, room_id: &RoomId) -> Outcome {
        if !self.is_registered(user_id) {
            return Outcome::Orphaned;
        }
        self.forget_seen(user_id, &invite_marker(room_id));
        self.dispatch(
            user_id,
            ProtocolEvent::Leave {
                room_id: room_id.to_owned(),
            },
            EventOrigin::State,
            false,
        )
        .await;
        Outcome::Handled {
            kind: "leave",
            historical: false,
        }
    }

    async fn handle_leave(&self, user_id: &UserId, room_id: &RoomId) {
        if !self.rooms.remove_room(user_id, room_id) {
            debug!("🔧 Leave for unknown room {} of {}", room_id, user_id);
            return;
        }
        self.queues.remove_room(user_id, room_id);
        self.names.remove_room(user_id, room_id);
        self.ui
            .notify(Notification::LeftRoom {
                user_id: user_id.to_owned(),
                room_id: room_id.to_owned(),
            })
            .await;
    }

    pub async fn process_presence(self: &Arc<Self>, user_id: &UserId, raw: RawEvent) -> Result<Outcome> {
        if !self.is_registered(user_id) {
            return Ok(Outcome::Orphaned);
        }
        let event = classify::classify_presence(raw)?;
        self.dispatch(user_id, event, EventOrigin::Timeline, false).await;
        Ok(Outcome::Handled {
            kind: "presence",
            historical: false,
        })
    }

    pub async fn process_ephemeral(self: &Arc<Self>, user_id: &UserId, room_id: &RoomId, raw: RawEvent) -> Outcome {
        if !self.is_registered(user_id) {
            return Outcome::Orphaned;
        }
        let event = classify::classify_ephemeral(room_id, raw);
        self.dispatch(user_id, event, EventOrigin::Timeline, false).await;
        Outcome::Handled {
            kind: "ephemeral",
            historical: false,
        }
    }

    /// Route everything in one sync response.
    pub async fn process_batch(self: &Arc<Self>, user_id: &UserId, batch: SyncBatch) {
        for room in batch.joined {
            self.rooms
                .note_prev_batch(user_id, &room.room_id, room.prev_batch.as_deref());
            if self.discard_if_gone(user_id, &room.room_id) {
                return;
            }
            for (raw, origin) in room
                .state
                .into_iter()
                .map(|e| (e, EventOrigin::State))
                .chain(room.timeline.into_iter().map(|e| (e, EventOrigin::Timeline)))
            {
                if let Err(e) = self.process_event(user_id, &room.room_id, raw, origin).await {
                    self.report_event_error("router", &e);
                }
            }
            for raw in room.ephemeral {
                self.process_ephemeral(user_id, &room.room_id, raw).await;
            }
        }
        for invite in batch.invited {
            self.process_invite(user_id, invite.room_id, invite.state).await;
        }
        for room_id in batch.left {
            self.process_leave(user_id, &room_id).await;
        }
        for raw in batch.presence {
            if let Err(e) = self.process_presence(user_id, raw).await {
                self.report_event_error("router.presence", &e);
            }
        }
    }

    /// Sync loop of one account. Transient failures back off and retry;
    /// anything else (revoked token, protocol error) stops the listener.
    async fn listen(self: Arc<Self>, session: Arc<dyn MatrixSession>) {
        let user_id = session.user_id().to_owned();
        let base = Duration::from_millis(self.sync.reconnect_backoff_ms.max(1));
        let max = Duration::from_millis(self.sync.max_reconnect_backoff_ms).max(base);
        let mut backoff = base;
        let mut since: Option<String> = None;

        info!("🚀 Sync listener started for {}", user_id);
        while self.is_registered(&user_id) {
            match session.sync(since.as_deref(), self.sync.timeout()).await {
                Ok(batch) => {
                    backoff = base;
                    since = Some(batch.next_batch.clone());
                    self.process_batch(&user_id, batch).await;
                }
                Err(e) if e.is_transient() => {
                    warn!("⚠️ Sync for {} failed, retrying in {:?}: {}", user_id, backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2).min(max);
                }
                Err(e) => {
                    self.errors.report(&format!("sync {user_id}"), &e);
                    break;
                }
            }
        }
        info!("🔧 Sync listener stopped for {}", user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{
            joined_batch, member_event, message_event, name_event, test_room_id, test_user_id, FakeHomeserver,
        },
        ui::{self, UiEvent, UiReceiver},
    };
    use harmony_core::{config::RouterConfig, now_millis};
    use std::time::Duration;

    struct Harness {
        router: Arc<EventRouter>,
        queues: Arc<MessageQueues>,
        rooms: Arc<RoomDirectory>,
        ui: UiReceiver,
        server: FakeHomeserver,
    }

    fn harness() -> Harness {
        let (ui_tx, ui) = ui::channel(256);
        let rooms = Arc::new(RoomDirectory::new());
        let names = Arc::new(DisplayNames::new(rooms.clone(), 64));
        let queues = Arc::new(MessageQueues::new(RouterConfig::default()));
        let errors = Arc::new(ErrorReporter::new(ui_tx.clone(), None));
        let sync = SyncConfig {
            timeout_ms: 20,
            reconnect_backoff_ms: 5,
            max_reconnect_backoff_ms: 20,
            ..SyncConfig::default()
        };
        let router = Arc::new(EventRouter::new(
            RouterDeps {
                rooms: rooms.clone(),
                names,
                queues: queues.clone(),
                ui: ui_tx,
                errors,
                event_log: None,
            },
            4,
            sync,
        ));
        Harness {
            router,
            queues,
            rooms,
            ui,
            server: FakeHomeserver::new(),
        }
    }

    async fn next_notification(ui: &mut UiReceiver) -> Notification {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), ui.recv())
                .await
                .expect("timed out waiting for a UI event")
                .expect("UI channel closed");
            if let UiEvent::Notification(notification) = event {
                return notification;
            }
        }
    }

    #[tokio::test]
    async fn duplicate_events_are_dropped() {
        let h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        h.router.attach(h.server.session(&alice), now_millis() - 60_000);

        let event = message_event("$1:example.org", &alice, now_millis(), "hi");
        let first = h
            .router
            .process_event(&alice, &room, event.clone(), EventOrigin::Timeline)
            .await
            .unwrap();
        assert_eq!(first, Outcome::Handled { kind: "message", historical: false });

        let second = h
            .router
            .process_event(&alice, &room, event, EventOrigin::Timeline)
            .await
            .unwrap();
        assert_eq!(second, Outcome::Duplicate);

        assert!(h.queues.pop(&alice, &room, QueueKind::Live).await.is_some());
        assert_eq!(h.queues.len(&alice, &room, QueueKind::Live), 0);
    }

    #[tokio::test]
    async fn new_room_is_announced_before_its_first_message() {
        let mut h = harness();
        let alice = test_user_id("alice");
        let bob = test_user_id("bob");
        let room = test_room_id("room");
        h.router.attach(h.server.session(&alice), now_millis() - 60_000);

        h.router
            .process_event(&alice, &room, message_event("$1:example.org", &bob, now_millis(), "hi"), EventOrigin::Timeline)
            .await
            .unwrap();

        assert_eq!(
            next_notification(&mut h.ui).await,
            Notification::NewRoom {
                user_id: alice.clone(),
                room_id: room.clone()
            }
        );
        match next_notification(&mut h.ui).await {
            Notification::NewMessage { sender, room_id, .. } => {
                assert_eq!(sender, bob);
                assert_eq!(room_id, room);
            }
            other => panic!("expected NewMessage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn messages_before_the_session_start_are_silent() {
        let mut h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        let start = now_millis();
        h.router.attach(h.server.session(&alice), start);

        let outcome = h
            .router
            .process_event(&alice, &room, message_event("$old:example.org", &alice, start - 5_000, "old"), EventOrigin::Timeline)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled { kind: "message", historical: true });

        let queued = h.queues.pop(&alice, &room, QueueKind::Live).await.unwrap();
        assert_eq!(queued.body, "old");
        let events = h.ui.drain();
        assert_eq!(events.len(), 1, "{events:?}");
        assert!(matches!(events[0], UiEvent::Notification(Notification::NewRoom { .. })));
    }

    #[tokio::test]
    async fn backfilled_messages_go_to_the_history_queue() {
        let h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        h.router.attach(h.server.session(&alice), now_millis());

        let outcome = h
            .router
            .process_event(&alice, &room, message_event("$b:example.org", &alice, now_millis(), "back"), EventOrigin::Backfill)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Handled { kind: "message", historical: true });
        assert!(h.queues.pop(&alice, &room, QueueKind::Backfill).await.is_some());
        assert_eq!(h.queues.len(&alice, &room, QueueKind::Live), 0);
    }

    #[tokio::test]
    async fn refetched_history_is_queued_again() {
        let h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        h.router.attach(h.server.session(&alice), now_millis());
        let event = message_event("$old:example.org", &alice, now_millis() - 60_000, "old");

        for _ in 0..2 {
            let outcome = h
                .router
                .process_event(&alice, &room, event.clone(), EventOrigin::Backfill)
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::Handled { kind: "message", historical: true });
        }
        assert!(h.queues.pop(&alice, &room, QueueKind::Backfill).await.is_some());
        assert!(h.queues.pop(&alice, &room, QueueKind::Backfill).await.is_some());

        // The same id arriving live afterwards is still a duplicate
        let live = h
            .router
            .process_event(&alice, &room, event, EventOrigin::Timeline)
            .await
            .unwrap();
        assert_eq!(live, Outcome::Duplicate);
    }

    #[tokio::test]
    async fn events_without_id_are_malformed() {
        let h = harness();
        let alice = test_user_id("alice");
        h.router.attach(h.server.session(&alice), now_millis());
        let mut event = message_event("$x:example.org", &alice, now_millis(), "x");
        event.event_id = None;

        let err = h
            .router
            .process_event(&alice, &test_room_id("room"), event, EventOrigin::Timeline)
            .await
            .unwrap_err();
        assert!(matches!(err, HarmonyError::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn renames_are_announced_once() {
        let mut h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        h.router.attach(h.server.session(&alice), now_millis() - 60_000);

        h.router
            .process_event(&alice, &room, name_event("$n1:example.org", &alice, "Lobby"), EventOrigin::State)
            .await
            .unwrap();
        assert!(matches!(next_notification(&mut h.ui).await, Notification::NewRoom { .. }));
        assert_eq!(
            next_notification(&mut h.ui).await,
            Notification::RoomRename {
                user_id: alice.clone(),
                room_id: room.clone(),
                name: "Lobby".into()
            }
        );

        // Same name again, then an older name from history: neither is news
        h.router
            .process_event(&alice, &room, name_event("$n2:example.org", &alice, "Lobby"), EventOrigin::Timeline)
            .await
            .unwrap();
        h.router
            .process_event(&alice, &room, name_event("$n0:example.org", &alice, "Old"), EventOrigin::Backfill)
            .await
            .unwrap();
        assert!(h.ui.drain().is_empty());
    }

    #[tokio::test]
    async fn own_profile_changes_are_reported() {
        let mut h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        h.router.attach(h.server.session(&alice), now_millis() - 60_000);

        let event = member_event(
            "$m1:example.org",
            &alice,
            &alice,
            "join",
            Some("Alice A."),
            Some(serde_json::json!({ "membership": "join", "displayname": "Alice" })),
        );
        h.router
            .process_event(&alice, &room, event, EventOrigin::Timeline)
            .await
            .unwrap();

        assert!(matches!(next_notification(&mut h.ui).await, Notification::NewRoom { .. }));
        assert_eq!(
            next_notification(&mut h.ui).await,
            Notification::AccountChange {
                user_id: alice.clone(),
                display_name: "Alice A.".into(),
                avatar_url: None
            }
        );
    }

    #[tokio::test]
    async fn invites_are_named_and_deduplicated_until_left() {
        let mut h = harness();
        let alice = test_user_id("alice");
        let bob = test_user_id("bob");
        let room = test_room_id("secret");
        h.router.attach(h.server.session(&alice), now_millis());

        let state = vec![
            member_event("$a:example.org", &bob, &bob, "join", Some("Bob"), None),
            member_event("$b:example.org", &bob, &alice, "invite", None, None),
        ];
        let outcome = h.router.process_invite(&alice, room.clone(), state.clone()).await;
        assert_eq!(outcome, Outcome::Handled { kind: "invite", historical: false });
        match next_notification(&mut h.ui).await {
            Notification::NewInvite {
                display_name,
                invited_by,
                name,
                ..
            } => {
                assert_eq!(display_name, "Bob");
                assert_eq!(invited_by, Some(bob.clone()));
                assert_eq!(name, None);
            }
            other => panic!("expected NewInvite, got {other:?}"),
        }

        assert_eq!(h.router.process_invite(&alice, room.clone(), state.clone()).await, Outcome::Duplicate);
        h.router.process_leave(&alice, &room).await;
        assert_eq!(
            h.router.process_invite(&alice, room, state).await,
            Outcome::Handled { kind: "invite", historical: false }
        );
    }

    #[tokio::test]
    async fn leaving_a_known_room_drops_its_state() {
        let mut h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        h.router.attach(h.server.session(&alice), now_millis());
        h.router
            .process_event(&alice, &room, name_event("$n:example.org", &alice, "Lobby"), EventOrigin::State)
            .await
            .unwrap();
        assert_eq!(h.rooms.rooms_of(&alice), vec![room.clone()]);

        h.router.process_leave(&alice, &room).await;
        assert!(h.rooms.rooms_of(&alice).is_empty());
        assert!(h.queues.queue(&alice, &room).is_none());
        let left = h
            .ui
            .drain()
            .into_iter()
            .any(|e| matches!(e, UiEvent::Notification(Notification::LeftRoom { .. })));
        assert!(left);
    }

    #[tokio::test]
    async fn events_after_unregister_are_orphaned() {
        let h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        h.router.attach(h.server.session(&alice), now_millis());
        h.router.unregister(&alice);

        let outcome = h
            .router
            .process_event(&alice, &room, message_event("$1:example.org", &alice, now_millis(), "late"), EventOrigin::Timeline)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Orphaned);
        assert_eq!(h.router.process_leave(&alice, &room).await, Outcome::Orphaned);
        assert!(!h.rooms.is_announced(&alice, &room));
    }

    #[tokio::test]
    async fn listener_routes_sync_batches() {
        let mut h = harness();
        let alice = test_user_id("alice");
        let room = test_room_id("room");
        h.router.register(h.server.session(&alice), now_millis() - 60_000);
        h.server.push_batch(
            &alice,
            joined_batch(&room, Some("p0"), vec![message_event("$1:example.org", &alice, now_millis(), "hello")]),
        );

        assert!(matches!(next_notification(&mut h.ui).await, Notification::NewRoom { .. }));
        assert!(matches!(next_notification(&mut h.ui).await, Notification::NewMessage { .. }));
        assert_eq!(h.rooms.pagination(&alice, &room).token.as_deref(), Some("p0"));

        h.router.unregister(&alice);
        assert!(h.router.accounts().is_empty());
    }
}
