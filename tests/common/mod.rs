//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use harmony::{
    core::LoginRequest,
    ruma::OwnedUserId,
    test_utils::{init_test_tracing, test_config, FakeHomeserver},
    HarmonyConfig, Services, UiEvent, UiReceiver,
};
use tempfile::TempDir;

pub const SERVER_URL: &str = "https://example.org";
pub const PASSWORD: &str = "correct horse";

pub struct Client {
    pub services: Arc<Services>,
    pub server: FakeHomeserver,
    pub events: Arc<Mutex<Vec<UiEvent>>>,
    pub dir: TempDir,
}

/// Keep the UI channel drained, recording everything posted to it.
pub fn record(ui: UiReceiver) -> Arc<Mutex<Vec<UiEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    tokio::spawn(ui.run(move |event| sink.lock().unwrap().push(event)));
    events
}

pub async fn client_with(server: FakeHomeserver, dir: TempDir, tweak: impl FnOnce(&mut HarmonyConfig)) -> Client {
    init_test_tracing();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let (services, ui) = Services::build(config, Arc::new(server.clone())).await.unwrap();
    Client {
        services,
        server,
        events: record(ui),
        dir,
    }
}

pub async fn client() -> Client {
    client_with(FakeHomeserver::new(), tempfile::tempdir().unwrap(), |_| {}).await
}

pub fn login_request(user: &str, password: &str, remember: bool) -> LoginRequest {
    LoginRequest {
        server_url: SERVER_URL.to_owned(),
        user: user.to_owned(),
        password: password.to_owned(),
        device_name: None,
        remember,
    }
}

impl Client {
    /// Register `local` on the fake server and log it in.
    pub async fn login(&self, local: &str) -> OwnedUserId {
        let user_id = harmony::test_utils::test_user_id(local);
        self.server.add_user(&user_id, PASSWORD);
        self.services
            .accounts
            .login(login_request(local, PASSWORD, false), |_| {})
            .unwrap()
            .wait()
            .await
            .unwrap()
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
