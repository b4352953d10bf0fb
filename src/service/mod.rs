// =============================================================================
// Harmony Matrix Client - Service Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Central service container. Builds every part of the event-to-UI
//   pipeline in dependency order and owns the registry of open chat views.
//
// Architecture:
//   • accounts → events (router) → messages (queues) → display (views)
//   • rooms / caches hold per-account room state and resolved names
//   • sending serializes outgoing messages per (account, room)
//   • errors / event_logger are the shared sinks
//
// =============================================================================

pub mod accounts;
pub mod caches;
pub mod commands;
pub mod display;
pub mod errors;
pub mod event_logger;
pub mod events;
pub mod messages;
pub mod rooms;
pub mod sending;

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Instant,
};

use harmony_core::{HarmonyConfig, Result, SessionFactory};
use lru::LruCache;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tracing::{debug, info, instrument};

use self::{
    accounts::{AccountDeps, AccountManager, CredentialStore},
    caches::DisplayNames,
    commands::{builtin_table, AutorunStore, CommandContext, CommandTable},
    display::{ChatView, DEFAULT_PAGE_HEIGHT},
    errors::ErrorReporter,
    event_logger::EventLogger,
    events::{EventRouter, RouterDeps},
    messages::MessageQueues,
    rooms::RoomDirectory,
    sending::SendQueues,
};
use crate::ui::{self, UiReceiver, UiSender};

/// Entries per display-name cache.
const NAME_CACHE_CAPACITY: usize = 4096;

type ViewKey = (OwnedUserId, OwnedRoomId);

/// Every service of the client, wired together.
pub struct Services {
    pub config: HarmonyConfig,
    pub ui: UiSender,
    pub errors: Arc<ErrorReporter>,
    pub rooms: Arc<RoomDirectory>,
    pub names: Arc<DisplayNames>,
    pub queues: Arc<MessageQueues>,
    pub router: Arc<EventRouter>,
    pub sending: Arc<SendQueues>,
    pub accounts: Arc<AccountManager>,
    pub commands: Arc<CommandTable>,
    pub autorun: AutorunStore,
    autorun_started: AtomicBool,
    views: StdMutex<LruCache<ViewKey, Arc<ChatView>>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("accounts", &self.accounts)
            .field("router", &self.router)
            .field("open_views", &self.open_views())
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Build all services. Must run inside a Tokio runtime; the returned
    /// receiver is the UI side of the pipeline.
    #[instrument(level = "info", skip(config, factory))]
    pub async fn build(config: HarmonyConfig, factory: Arc<dyn SessionFactory>) -> Result<(Arc<Self>, UiReceiver)> {
        let start_time = Instant::now();
        info!("🚀 Initializing Harmony services");
        config.validate()?;

        let (ui, ui_rx) = ui::channel(config.ui_channel_capacity);
        let log_file = Some(config.errors.log_file.clone()).filter(|p| !p.as_os_str().is_empty());
        let errors = Arc::new(ErrorReporter::new(ui.clone(), log_file));
        debug!("✅ Error reporter ready");

        let rooms = Arc::new(RoomDirectory::new());
        let names = Arc::new(DisplayNames::new(rooms.clone(), NAME_CACHE_CAPACITY));
        let queues = Arc::new(MessageQueues::new(config.router.clone()));
        let event_log = config
            .event_log
            .enabled
            .then(|| EventLogger::spawn(config.event_log.clone(), errors.clone()));
        debug!("✅ Room state and queues ready (event log: {})", event_log.is_some());

        let router = Arc::new(EventRouter::new(
            RouterDeps {
                rooms: rooms.clone(),
                names: names.clone(),
                queues: queues.clone(),
                ui: ui.clone(),
                errors: errors.clone(),
                event_log,
            },
            config.router.handoff_workers,
            config.sync.clone(),
        ));
        let sending = Arc::new(SendQueues::new(router.clone(), errors.clone()));
        debug!("✅ Router and send queues ready");

        let accounts = Arc::new(AccountManager::new(
            AccountDeps {
                factory,
                router: router.clone(),
                sending: sending.clone(),
                credentials: CredentialStore::new(config.accounts_file.clone()),
                ui: ui.clone(),
                errors: errors.clone(),
            },
            config.login.clone(),
        ));

        let view_capacity = NonZeroUsize::new(config.display.view_cache_size).unwrap_or(NonZeroUsize::MIN);
        let services = Arc::new(Self {
            ui,
            errors,
            rooms,
            names,
            queues,
            router,
            sending,
            accounts,
            commands: Arc::new(builtin_table()),
            autorun: AutorunStore::new(config.autorun.file.clone()),
            autorun_started: AtomicBool::new(false),
            views: StdMutex::new(LruCache::new(view_capacity)),
            config,
        });

        info!("🎉 Harmony services initialized in {:?}", start_time.elapsed());
        Ok((services, ui_rx))
    }

    /// Chat view of `room_id` as seen by `user_id`, opened on first use.
    ///
    /// Views are kept in an LRU registry; a view pushed out of it is closed.
    /// The first view opened runs the autorun commands.
    pub fn open_chat(self: &Arc<Self>, user_id: &UserId, room_id: &RoomId) -> Result<Arc<ChatView>> {
        let key = (user_id.to_owned(), room_id.to_owned());
        let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(view) = views.get(&key) {
            return Ok(view.clone());
        }

        let view = ChatView::open(self, user_id, room_id, DEFAULT_PAGE_HEIGHT)?;
        if let Some((evicted, old)) = views.push(key, view.clone()) {
            debug!("🔧 Closing least recently used view {} / {}", evicted.0, evicted.1);
            old.close();
        }
        drop(views);

        if self.config.autorun.enabled && !self.autorun_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(commands::autorun::run_startup(CommandContext {
                services: self.clone(),
                view: view.clone(),
            }));
        }
        Ok(view)
    }

    /// Close the view of `room_id` for `user_id`, if open.
    pub fn close_chat(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        let key = (user_id.to_owned(), room_id.to_owned());
        let removed = self.views.lock().unwrap_or_else(|e| e.into_inner()).pop(&key);
        match removed {
            Some(view) => {
                view.close();
                true
            }
            None => false,
        }
    }

    pub fn open_views(&self) -> usize {
        self.views.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Evaluate composer input typed into `view`.
    pub async fn eval(self: &Arc<Self>, view: Arc<ChatView>, text: &str) -> Result<()> {
        commands::eval(
            CommandContext {
                services: self.clone(),
                view,
            },
            text,
        )
        .await
    }

    /// Log out `user_id` and close every view it owns.
    #[instrument(level = "debug", skip(self))]
    pub async fn logout(&self, user_id: &UserId) -> Result<()> {
        self.close_views_of(user_id);
        self.accounts.logout(user_id).await
    }

    fn close_views_of(&self, user_id: &UserId) -> usize {
        let closed: Vec<Arc<ChatView>> = {
            let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<ViewKey> = views
                .iter()
                .filter(|((owner, _), _)| owner == user_id)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| views.pop(key)).collect()
        };
        for view in &closed {
            view.close();
        }
        closed.len()
    }

    /// Stop all listeners and views without logging out server-side.
    pub fn shutdown(&self) {
        let views: Vec<Arc<ChatView>> = {
            let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
            let all = views.iter().map(|(_, view)| view.clone()).collect();
            views.clear();
            all
        };
        for view in views {
            view.close();
        }
        for user_id in self.router.accounts() {
            self.router.unregister(&user_id);
        }
        info!("👋 Harmony services stopped");
    }
}
