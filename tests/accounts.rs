//! Account lifecycle: login outcomes, remembered credentials and logout
//! while events are still flowing.

mod common;

use std::time::Duration;

use common::{client, client_with, eventually, login_request, PASSWORD};
use harmony::{
    core::now_millis,
    test_utils::{joined_batch, message_event, test_room_id, test_user_id, FakeHomeserver},
    HarmonyError, Notification, UiEvent,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_password_fails_with_auth_error() {
    let c = client().await;
    c.server.add_user(&test_user_id("alice"), PASSWORD);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let pending = c
        .services
        .accounts
        .login(login_request("alice", "wrong", false), move |e| {
            let _ = tx.send(e.kind_label());
        })
        .unwrap();

    assert!(matches!(pending.wait().await, Err(HarmonyError::Auth(_))));
    assert_eq!(rx.await.unwrap(), "auth");
    assert!(c.services.accounts.accounts().is_empty());

    let events = &c.events;
    eventually("LoginFailed", || async move {
        events.lock().unwrap().iter().any(|e| {
            matches!(e, UiEvent::Notification(Notification::LoginFailed { kind: "auth", .. }))
        })
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_server_is_not_reported_as_bad_credentials() {
    let c = client().await;
    c.server.add_user(&test_user_id("alice"), PASSWORD);
    c.server.set_unreachable(true);

    let result = c
        .services
        .accounts
        .login(login_request("@alice:example.org", PASSWORD, false), |_| {})
        .unwrap()
        .wait()
        .await;
    assert!(matches!(result, Err(HarmonyError::Unreachable(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_login_times_out_as_unreachable() {
    let server = FakeHomeserver::new();
    server.add_user(&test_user_id("alice"), PASSWORD);
    server.set_login_delay(Some(Duration::from_secs(3)));
    let c = client_with(server, tempfile::tempdir().unwrap(), |config| config.login.timeout_secs = 1).await;

    let result = c
        .services
        .accounts
        .login(login_request("alice", PASSWORD, false), |_| {})
        .unwrap()
        .wait()
        .await;
    assert!(matches!(result, Err(HarmonyError::Unreachable(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remembered_accounts_log_in_on_next_start() {
    let server = FakeHomeserver::new();
    server.add_user(&test_user_id("alice"), PASSWORD);
    server.add_user(&test_user_id("bob"), PASSWORD);
    let dir = tempfile::tempdir().unwrap();
    let accounts_file = dir.path().join("accounts.json");

    {
        let first = client_with(server.clone(), tempfile::tempdir().unwrap(), |config| {
            config.accounts_file = accounts_file.clone();
        })
        .await;
        for user in ["alice", "bob"] {
            first
                .services
                .accounts
                .login(login_request(user, PASSWORD, true), |_| {})
                .unwrap()
                .wait()
                .await
                .unwrap();
        }
        let raw = std::fs::read_to_string(&accounts_file).unwrap();
        assert!(!raw.contains(PASSWORD), "password stored in clear");
        first.services.shutdown();
    }

    let second = client_with(server, dir, |_| {}).await;
    let pending = second.services.accounts.login_using_config().await.unwrap();
    assert_eq!(pending.len(), 2);
    for login in pending {
        login.wait().await.unwrap();
    }
    assert_eq!(
        second.services.accounts.accounts(),
        vec![test_user_id("alice"), test_user_id("bob")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn logout_forgets_the_account() {
    let c = client().await;
    c.server.add_user(&test_user_id("alice"), PASSWORD);
    let alice = c
        .services
        .accounts
        .login(login_request("alice", PASSWORD, true), |_| {})
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(c.services.accounts.credentials().read().await.unwrap().len(), 1);

    c.services.logout(&alice).await.unwrap();

    assert!(!c.services.accounts.is_logged_in(&alice));
    assert!(!c.services.router.is_registered(&alice));
    assert!(c.services.accounts.credentials().read().await.unwrap().is_empty());
    let server = &c.server;
    eventually("the server-side logout", || async move { server.logouts().len() == 1 }).await;
    assert!(matches!(
        c.services.logout(&alice).await,
        Err(HarmonyError::UnknownAccount(_))
    ));

    let events = c.events();
    let gone = events
        .iter()
        .position(|e| matches!(e, UiEvent::Notification(Notification::AccountGone { .. })));
    let new = events
        .iter()
        .position(|e| matches!(e, UiEvent::Notification(Notification::NewAccount { .. })));
    assert!(new < gone, "{events:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn logout_while_messages_arrive_is_safe() {
    let c = client().await;
    let alice = c.login("alice").await;
    let room = test_room_id("busy");
    let view = c.services.open_chat(&alice, &room).unwrap();

    let server = c.server.clone();
    let producer_user = alice.clone();
    let producer_room = room.clone();
    let producer = tokio::spawn(async move {
        for n in 0..200 {
            let event = message_event(&format!("$busy{n}:example.org"), &producer_user, now_millis(), "spam");
            server.push_batch(&producer_user, joined_batch(&producer_room, None, vec![event]));
            tokio::task::yield_now().await;
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    c.services.logout(&alice).await.unwrap();
    producer.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(c.services.router.accounts().is_empty());
    assert!(c.services.rooms.rooms_of(&alice).is_empty());
    assert!(c.services.queues.queue(&alice, &room).is_none());
    assert_eq!(c.services.open_views(), 0);
    // The closed view refuses new input
    assert!(view.send_markdown("too late").is_err());
}
