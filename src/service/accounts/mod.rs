// =============================================================================
// Harmony Matrix Client - Account Registry Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Logged-in accounts. Login and logout never block the caller: the
//   handshake runs on a bounded worker pool and failures are handed to the
//   caller's error callback as well as the UI.
//
// Features:
//   • User id normalization (`name`, `@name`, `@name:server`)
//   • Login timeout reported as an unreachable server, not bad credentials
//   • "Account gone" is published before anything is torn down
//   • Remembered accounts in an atomically written credential file
//
// =============================================================================

pub mod credentials;

pub use credentials::{decode_password, encode_password, Credential, CredentialStore};

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use harmony_core::{
    config::LoginConfig, now_millis, HarmonyError, LoginRequest, MatrixSession, Millis, Result, SessionFactory,
};
use ruma::{OwnedUserId, UserId};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{error, info, instrument, warn};

use super::{errors::ErrorReporter, events::EventRouter, sending::SendQueues};
use crate::ui::{Notification, UiSender};

/// One logged-in account.
#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: OwnedUserId,
    pub server_url: String,
    pub session: Arc<dyn MatrixSession>,
    pub logged_in_at: Millis,
}

/// Handle to a login running in the background.
#[derive(Debug)]
pub struct PendingLogin {
    pub user_id: OwnedUserId,
    handle: JoinHandle<Result<OwnedUserId>>,
}

impl PendingLogin {
    /// Wait for the handshake to finish.
    pub async fn wait(self) -> Result<OwnedUserId> {
        self.handle
            .await
            .map_err(|e| HarmonyError::Internal(format!("login task failed: {e}")))?
    }
}

/// Turn what the user typed into a full user id.
///
/// `@name:server` is kept, `name:server` gets its sigil, and a bare `name`
/// or `@name` is placed on the host of `server_url`.
pub fn normalize_user_id(user: &str, server_url: &str) -> Result<OwnedUserId> {
    let user = user.trim();
    let local = user.strip_prefix('@').unwrap_or(user);
    if local.is_empty() {
        return Err(HarmonyError::InvalidId(format!("empty user id {user:?}")));
    }
    if local.contains(':') {
        return Ok(UserId::parse(format!("@{local}"))?);
    }

    let url = url::Url::parse(server_url.trim())
        .map_err(|e| HarmonyError::Config(format!("invalid server url {server_url:?}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| HarmonyError::Config(format!("server url {server_url:?} has no host")))?;
    let server = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    Ok(UserId::parse(format!("@{local}:{server}"))?)
}

/// Account registry.
pub struct AccountManager {
    factory: Arc<dyn SessionFactory>,
    router: Arc<EventRouter>,
    sending: Arc<SendQueues>,
    credentials: CredentialStore,
    ui: UiSender,
    errors: Arc<ErrorReporter>,
    accounts: RwLock<HashMap<OwnedUserId, Account>>,
    workers: Arc<Semaphore>,
    config: LoginConfig,
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager")
            .field("accounts", &self.accounts())
            .field("credentials", &self.credentials.path())
            .finish()
    }
}

/// Collaborators of the account registry.
pub struct AccountDeps {
    pub factory: Arc<dyn SessionFactory>,
    pub router: Arc<EventRouter>,
    pub sending: Arc<SendQueues>,
    pub credentials: CredentialStore,
    pub ui: UiSender,
    pub errors: Arc<ErrorReporter>,
}

impl AccountManager {
    pub fn new(deps: AccountDeps, config: LoginConfig) -> Self {
        Self {
            factory: deps.factory,
            router: deps.router,
            sending: deps.sending,
            credentials: deps.credentials,
            ui: deps.ui,
            errors: deps.errors,
            accounts: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn accounts(&self) -> Vec<OwnedUserId> {
        let mut ids: Vec<_> = self
            .accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn get(&self, user_id: &UserId) -> Option<Account> {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()
    }

    pub fn is_logged_in(&self, user_id: &UserId) -> bool {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(user_id)
    }

    /// Start a login and return immediately.
    ///
    /// `on_error` runs on the login task if the handshake fails; a
    /// `LoginFailed` notification is posted as well.
    #[instrument(level = "debug", skip(self, request, on_error), fields(user = %request.user))]
    pub fn login<F>(self: &Arc<Self>, request: LoginRequest, on_error: F) -> Result<PendingLogin>
    where
        F: FnOnce(&HarmonyError) + Send + 'static,
    {
        let user_id = normalize_user_id(&request.user, &request.server_url)?;
        let manager = Arc::clone(self);
        let task_user = user_id.clone();

        let handle = tokio::spawn(async move {
            if manager.is_logged_in(&task_user) {
                info!("🔧 {} is already logged in", task_user);
                return Ok(task_user);
            }
            match manager.perform_login(&task_user, &request).await {
                Ok(()) => Ok(task_user),
                Err(e) => {
                    warn!("❌ Login of {} failed: {}", task_user, e);
                    manager
                        .ui
                        .notify(Notification::LoginFailed {
                            user_id: task_user.to_string(),
                            kind: e.kind_label(),
                            message: e.to_string(),
                        })
                        .await;
                    on_error(&e);
                    Err(e)
                }
            }
        });

        Ok(PendingLogin { user_id, handle })
    }

    async fn perform_login(&self, user_id: &UserId, request: &LoginRequest) -> Result<()> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| HarmonyError::Internal("login pool closed".to_owned()))?;

        let device_name = request
            .device_name
            .clone()
            .unwrap_or_else(|| self.config.device_name.clone());
        let timeout = self.config.timeout();
        info!("🚀 Logging in {} at {}", user_id, request.server_url);

        let session = tokio::time::timeout(
            timeout,
            self.factory
                .login(&request.server_url, user_id, &request.password, &device_name),
        )
        .await
        .map_err(|_| {
            HarmonyError::Unreachable(format!(
                "{} did not answer within {}s",
                request.server_url,
                timeout.as_secs()
            ))
        })??;

        let account = Account {
            user_id: user_id.to_owned(),
            server_url: request.server_url.clone(),
            session: session.clone(),
            logged_in_at: now_millis(),
        };
        let duplicate = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            if accounts.contains_key(user_id) {
                true
            } else {
                accounts.insert(user_id.to_owned(), account.clone());
                false
            }
        };
        if duplicate {
            // Lost a race against a concurrent login of the same account
            self.close_session(session);
            return Ok(());
        }

        self.ui
            .notify(Notification::NewAccount {
                user_id: user_id.to_owned(),
            })
            .await;
        self.router.register(session, account.logged_in_at);

        if request.remember {
            let credential = Credential {
                server_url: request.server_url.clone(),
                user_id: user_id.to_string(),
                password: request.password.clone(),
                device_name: request.device_name.clone(),
            };
            if let Err(e) = self.credentials.add(credential).await {
                self.errors.report("credentials", &e);
            }
        }
        info!("✅ Logged in {}", user_id);
        Ok(())
    }

    /// Log in every remembered account.
    pub async fn login_using_config(self: &Arc<Self>) -> Result<Vec<PendingLogin>> {
        let remembered = self.credentials.read().await?;
        info!("🔧 Logging in {} remembered accounts", remembered.len());

        let mut pending = Vec::with_capacity(remembered.len());
        for credential in remembered {
            let request = LoginRequest {
                server_url: credential.server_url,
                user: credential.user_id,
                password: credential.password,
                device_name: credential.device_name,
                remember: false,
            };
            let errors = self.errors.clone();
            match self.login(request, move |e| errors.report("login", e)) {
                Ok(login) => pending.push(login),
                Err(e) => self.errors.report("login", &e),
            }
        }
        Ok(pending)
    }

    /// Log out and forget an account.
    ///
    /// `AccountGone` is posted first so the UI can drop what depends on the
    /// account. The server-side logout runs in the background.
    #[instrument(level = "debug", skip(self))]
    pub async fn logout(&self, user_id: &UserId) -> Result<()> {
        let Some(account) = self.get(user_id) else {
            return Err(HarmonyError::UnknownAccount(user_id.to_string()));
        };

        self.ui
            .notify(Notification::AccountGone {
                user_id: user_id.to_owned(),
            })
            .await;

        self.accounts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);
        self.router.unregister(user_id);
        self.sending.remove_account(user_id);
        self.close_session(account.session);

        self.credentials.remove(user_id.as_str()).await?;
        info!("✅ Logged out {}", user_id);
        Ok(())
    }

    fn close_session(&self, session: Arc<dyn MatrixSession>) {
        let errors = self.errors.clone();
        tokio::spawn(async move {
            if let Err(e) = session.logout().await {
                error!("❌ Logout of {} failed: {}", session.user_id(), e);
                errors.report("logout", &e);
            }
        });
    }
}
