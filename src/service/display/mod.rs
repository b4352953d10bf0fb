// =============================================================================
// Harmony Matrix Client - Display Reconciler Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   One ChatView per open (account, room). Live messages, backfilled history
//   and the user's own local echoes are merged into a single document under
//   a render lock, and every change is published to the UI channel as an
//   incremental render update.
//
// Architecture:
//   • Live loop: pops the live queue, confirms or renders
//   • Backfill loop: pops the history queue, sorts into place
//   • Echo loop: renders optimistic blocks and submits the send
//   • History poller: requests older pages while at the top or underfilled
//
// =============================================================================

pub mod document;
pub mod echo;
pub mod history;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use harmony_core::{
    config::HistoryConfig, now_millis, ChatMessage, HarmonyError, MessageOrigin, QueueKind, Result, Severity,
};
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, instrument, warn};

pub use document::{Insertion, MessageDocument, RenderedBlock, Viewport};
pub use echo::PendingEchoes;
pub use history::{FetchOutcome, HistoryFetcher};

use super::{
    caches::DisplayNames,
    errors::ErrorReporter,
    messages::RoomQueue,
    sending::{SendQueues, SendRequest},
    Services,
};
use crate::{
    markdown::{normalize_html, render_outgoing},
    ui::{RenderUpdate, UiEvent, UiSender},
};

/// Default page height of a new view, in pixels.
pub const DEFAULT_PAGE_HEIGHT: u32 = 600;

struct OutgoingEcho {
    message: ChatMessage,
    request: SendRequest,
}

struct ViewState {
    user_id: OwnedUserId,
    room_id: OwnedRoomId,
    document: Mutex<MessageDocument>,
    echoes: StdMutex<PendingEchoes>,
    outgoing: mpsc::UnboundedSender<OutgoingEcho>,
    visible: AtomicBool,
    history: HistoryFetcher,
    history_config: HistoryConfig,
    names: Arc<DisplayNames>,
    sending: Arc<SendQueues>,
    ui: UiSender,
    errors: Arc<ErrorReporter>,
}

/// Chat view of one room as seen by one account.
pub struct ChatView {
    state: Arc<ViewState>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChatView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatView")
            .field("user_id", &self.state.user_id)
            .field("room_id", &self.state.room_id)
            .finish()
    }
}

impl ChatView {
    /// Open a view and start its loops.
    #[instrument(level = "debug", skip(services))]
    pub fn open(services: &Services, user_id: &UserId, room_id: &RoomId, page: u32) -> Result<Arc<Self>> {
        if !services.router.is_registered(user_id) {
            return Err(HarmonyError::UnknownAccount(user_id.to_string()));
        }
        let config = &services.config;
        let queue = services.queues.create_room(user_id, room_id);
        if services.rooms.begin_viewing(user_id, room_id) {
            debug!("🔧 {} / {} viewed before, paging history from the newest event", user_id, room_id);
        }
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let state = Arc::new(ViewState {
            user_id: user_id.to_owned(),
            room_id: room_id.to_owned(),
            document: Mutex::new(MessageDocument::new(&config.display, now_millis(), page)),
            echoes: StdMutex::new(PendingEchoes::new(config.display.echo_ttl())),
            outgoing,
            visible: AtomicBool::new(true),
            history: HistoryFetcher::new(
                user_id.to_owned(),
                room_id.to_owned(),
                services.router.clone(),
                services.rooms.clone(),
            ),
            history_config: config.history.clone(),
            names: services.names.clone(),
            sending: services.sending.clone(),
            ui: services.ui.clone(),
            errors: services.errors.clone(),
        });

        let tasks = vec![
            tokio::spawn(state.clone().live_loop(queue.clone())),
            tokio::spawn(state.clone().backfill_loop(queue)),
            tokio::spawn(state.clone().echo_loop(outgoing_rx)),
            tokio::spawn(state.clone().poll_history()),
        ];
        info!("✅ Opened chat view {} / {}", user_id, room_id);

        Ok(Arc::new(Self {
            state,
            tasks: StdMutex::new(tasks),
        }))
    }

    pub fn user_id(&self) -> &UserId {
        &self.state.user_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.state.room_id
    }

    /// Render `text` (markdown) immediately and send it in the background.
    pub fn send_markdown(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let html = render_outgoing(text);
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let message = ChatMessage {
            event_id: None,
            sender: self.state.user_id.clone(),
            room_id: self.state.room_id.clone(),
            receiver: self.state.user_id.clone(),
            html: normalize_html(&html),
            body: text.to_owned(),
            timestamp: now_millis(),
            origin: MessageOrigin::LocalEcho,
            transaction_id: Some(txn_id.clone()),
        };
        let request = SendRequest {
            html,
            body: text.to_owned(),
            txn_id,
        };
        self.state
            .outgoing
            .send(OutgoingEcho { message, request })
            .map_err(|_| HarmonyError::Internal(format!("chat view {} is closed", self.state.room_id)))
    }

    /// Print an informational line at the end of the view.
    pub async fn system_print(&self, text: &str, severity: Severity) {
        self.state.system_print(text, severity).await;
    }

    pub fn set_visible(&self, visible: bool) {
        self.state.visible.store(visible, Ordering::Relaxed);
    }

    pub fn is_visible(&self) -> bool {
        self.state.visible.load(Ordering::Relaxed)
    }

    pub async fn scroll_to(&self, offset: u32) -> Viewport {
        let mut doc = self.state.document.lock().await;
        let viewport = doc.scroll_to(offset);
        self.state.publish(RenderUpdate::Scrolled { viewport }).await;
        viewport
    }

    pub async fn resize(&self, page: u32) -> Viewport {
        let mut doc = self.state.document.lock().await;
        let viewport = doc.resize(page);
        self.state.publish(RenderUpdate::Scrolled { viewport }).await;
        viewport
    }

    /// Fetch one page of history now instead of waiting for the poller.
    pub async fn load_history(&self, limit: u16) -> Result<FetchOutcome> {
        self.state.history.fetch(limit).await
    }

    pub fn history_exhausted(&self) -> bool {
        self.state.history.reached_end()
    }

    /// Unconfirmed local echoes.
    pub fn pending_echoes(&self) -> usize {
        self.state
            .echoes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Read the document under the render lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&MessageDocument) -> R) -> R {
        f(&*self.state.document.lock().await)
    }

    /// Stop all loops of the view.
    pub fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in &tasks {
            task.abort();
        }
        if !tasks.is_empty() {
            debug!("🔧 Closed chat view {} / {}", self.state.user_id, self.state.room_id);
        }
    }
}

impl Drop for ChatView {
    fn drop(&mut self) {
        self.close();
    }
}

impl ViewState {
    async fn publish(&self, update: RenderUpdate) {
        self.ui
            .post(UiEvent::Render {
                user_id: self.user_id.clone(),
                room_id: self.room_id.clone(),
                update,
            })
            .await;
    }

    async fn publish_insertion(&self, insertion: Insertion) {
        self.publish(RenderUpdate::Inserted {
            index: insertion.index,
            block: insertion.block,
            regrouped: insertion.regrouped,
            viewport: insertion.viewport,
        })
        .await;
    }

    async fn insert(&self, doc: &mut MessageDocument, message: ChatMessage) {
        let sender_name = self.names.user_name(&self.user_id, &self.room_id, &message.sender);
        let insertion = doc.insert_message(message, &sender_name);
        self.publish_insertion(insertion).await;
    }

    async fn system_print(&self, text: &str, severity: Severity) {
        let mut doc = self.document.lock().await;
        let insertion = doc.append_system(text, severity);
        self.publish_insertion(insertion).await;
    }

    /// An incoming message either confirms one of our echoes or is rendered.
    /// History can deliver our own message before the live stream does.
    async fn render_incoming(&self, message: ChatMessage) {
        let mut doc = self.document.lock().await;
        if message.event_id.as_deref().is_some_and(|id| doc.contains_event(id)) {
            debug!("🔧 {:?} already shown in {}", message.event_id, self.room_id);
            return;
        }
        let matched = self
            .echoes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_match(&message);

        if let (Some(txn_id), Some(event_id)) = (matched, message.event_id.clone()) {
            if let Some(index) = doc.confirm_echo(&txn_id, event_id.clone()) {
                debug!("🔧 Local echo {} confirmed as {}", txn_id, event_id);
                self.publish(RenderUpdate::Confirmed { index, event_id }).await;
                return;
            }
        }
        self.insert(&mut doc, message).await;
    }

    async fn live_loop(self: Arc<Self>, queue: Arc<RoomQueue>) {
        while let Some(message) = queue.pop(QueueKind::Live).await {
            self.render_incoming(message).await;
        }
        debug!("🔧 Live loop of {} / {} ended", self.user_id, self.room_id);
    }

    async fn backfill_loop(self: Arc<Self>, queue: Arc<RoomQueue>) {
        while let Some(message) = queue.pop(QueueKind::Backfill).await {
            self.render_incoming(message).await;
        }
        debug!("🔧 Backfill loop of {} / {} ended", self.user_id, self.room_id);
    }

    async fn echo_loop(self: Arc<Self>, mut outgoing: mpsc::UnboundedReceiver<OutgoingEcho>) {
        while let Some(OutgoingEcho { message, request }) = outgoing.recv().await {
            let mut doc = self.document.lock().await;
            self.echoes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.txn_id.clone(), message.echo_key());
            self.insert(&mut doc, message).await;

            let view = Arc::clone(&self);
            self.sending.send(
                &self.user_id,
                &self.room_id,
                request,
                Box::new(move |err: HarmonyError| {
                    tokio::spawn(async move {
                        view.system_print(&format!("Sending failed ({}): {}", err.kind_label(), err), Severity::Error)
                            .await;
                    });
                }),
            );
        }
    }

    async fn poll_history(self: Arc<Self>) {
        tokio::time::sleep(self.history_config.start_delay()).await;
        let mut ticker = tokio::time::interval(self.history_config.poll_interval().max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.visible.load(Ordering::Relaxed) {
                continue;
            }
            let limit = {
                let doc = self.document.lock().await;
                if doc.content_fits() {
                    self.history_config.initial_batch
                } else if doc.at_top() {
                    self.history_config.batch
                } else {
                    continue;
                }
            };

            match self.history.fetch(limit).await {
                Ok(FetchOutcome::Exhausted) | Ok(FetchOutcome::Fetched { reached_end: true, .. }) => {
                    self.publish(RenderUpdate::HistoryExhausted).await;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => warn!("⚠️ History fetch for {} failed: {}", self.room_id, e),
                Err(e) => {
                    self.errors.report("history", &e);
                    break;
                }
            }
        }
        debug!("🔧 History poller of {} / {} stopped", self.user_id, self.room_id);
    }
}
