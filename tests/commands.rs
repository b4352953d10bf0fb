//! Composer input evaluation: messages, built-in commands and aliases.

mod common;

use std::sync::Arc;

use common::{client, client_with, eventually, Client};
use harmony::{
    service::display::ChatView,
    test_utils::{test_room_id, DisplayNameChange, FakeHomeserver},
    HarmonyError,
};

async fn setup() -> (Client, Arc<ChatView>) {
    let c = client().await;
    let alice = c.login("alice").await;
    let view = c.services.open_chat(&alice, &test_room_id("room")).unwrap();
    (c, view)
}

async fn view_contains(view: &ChatView, needle: &str) -> bool {
    view.inspect(|d| (0..d.len()).any(|i| d.html(i).is_some_and(|h| h.contains(needle))))
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plain_text_and_escaped_slashes_are_sent() {
    let (c, view) = setup().await;

    c.services.eval(view.clone(), "hello there").await.unwrap();
    c.services.eval(view.clone(), "//shrug").await.unwrap();

    let server = &c.server;
    eventually("both sends", || async move { server.sent().len() == 2 }).await;
    let bodies: Vec<_> = c.server.sent().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, ["hello there", "/shrug"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_commands_print_an_error_line() {
    let (c, view) = setup().await;

    let err = c.services.eval(view.clone(), "/frobnicate now").await.unwrap_err();
    assert!(matches!(err, HarmonyError::CommandNotFound(ref name) if name == "frobnicate"));
    assert!(view_contains(&view, "(command-not-found) Command not found: `/frobnicate`").await);
    assert!(view_contains(&view, "system error").await);
    assert!(c.server.sent().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_errors_name_their_kind() {
    let (c, view) = setup().await;

    let err = c
        .services
        .eval(view.clone(), "/say hi with_accounts=@carol")
        .await
        .unwrap_err();
    assert!(matches!(err, HarmonyError::UnknownAccount(_)));
    assert!(view_contains(&view, "(unknown-account)").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn say_from_several_accounts() {
    let (c, view) = setup().await;
    c.login("bob").await;

    c.services
        .eval(view.clone(), "/say hi all with_accounts=@,@bob")
        .await
        .unwrap();

    let server = &c.server;
    eventually("two sends", || async move { server.sent().len() == 2 }).await;
    let mut senders: Vec<_> = c.server.sent().into_iter().map(|m| (m.sender.to_string(), m.body)).collect();
    senders.sort();
    assert_eq!(
        senders,
        [
            ("@alice:example.org".to_owned(), "hi all".to_owned()),
            ("@bob:example.org".to_owned(), "hi all".to_owned())
        ]
    );

    let err = c
        .services
        .eval(view.clone(), "/say hi with_accounts=@carol")
        .await
        .unwrap_err();
    assert!(matches!(err, HarmonyError::UnknownAccount(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aliases_expand_into_commands() {
    let (c, view) = setup().await;

    c.services.eval(view.clone(), "/alias greet say hi {}").await.unwrap();
    c.services.eval(view.clone(), "/greet there").await.unwrap();

    let server = &c.server;
    eventually("the aliased send", || async move { server.sent().len() == 1 }).await;
    assert_eq!(c.server.sent()[0].body, "hi there");

    // Built-in names cannot be shadowed
    assert!(c.services.eval(view.clone(), "/alias say help").await.is_err());

    c.services.eval(view.clone(), "/alias -r greet").await.unwrap();
    assert!(matches!(
        c.services.eval(view.clone(), "/greet again").await,
        Err(HarmonyError::CommandNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn help_lists_commands() {
    let (c, view) = setup().await;

    c.services.eval(view.clone(), "/help").await.unwrap();
    assert!(view_contains(&view, "/say").await);
    assert!(view_contains(&view, "/alias").await);

    c.services.eval(view.clone(), "/help say full=yes").await.unwrap();
    assert!(view_contains(&view, "with_accounts").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nick_sets_global_and_room_display_names() {
    let (c, view) = setup().await;
    let alice = view.user_id().to_owned();

    c.services.eval(view.clone(), "/nick \"Alice A.\"").await.unwrap();
    c.services.eval(view.clone(), "/nick only_for_room=yes").await.unwrap();

    assert_eq!(
        c.server.display_names(),
        [
            DisplayNameChange {
                user_id: alice.clone(),
                name: "Alice A.".to_owned(),
                room_id: None,
            },
            DisplayNameChange {
                user_id: alice.clone(),
                name: alice.to_string(),
                room_id: Some(test_room_id("room")),
            },
        ]
    );
    assert!(view_contains(&view, "set to Alice A.").await);

    let err = c.services.eval(view.clone(), "/nick Bob user=@bob").await.unwrap_err();
    assert!(matches!(err, HarmonyError::UnknownAccount(_)));
    assert_eq!(c.server.display_names().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn autorun_adds_runs_and_resets_commands() {
    let (c, view) = setup().await;
    let path = c.services.autorun.path().to_owned();

    c.services
        .eval(view.clone(), "/autorun \"/alias greet say hi {}\"")
        .await
        .unwrap();
    assert!(c.services.commands.alias("greet").is_some());
    // Only the added command runs, not the defaults
    assert!(c.services.commands.alias("h").is_none());
    let stored: Vec<String> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(stored, ["/alias /h /help", "/alias greet say hi {}"]);
    assert!(view_contains(&view, "Autorun file:").await);

    c.services.eval(view.clone(), "/autorun --reset -r").await.unwrap();
    assert!(c.services.commands.alias("h").is_some());
    let stored: Vec<String> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(stored, ["/alias /h /help"]);

    assert!(c.services.eval(view.clone(), "/autorun --bogus").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_view_runs_autorun_commands_once() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("autorun.json");
    std::fs::write(&file, r#"["/alias greet say hi {}", "/frobnicate", "/alias /h /help"]"#).unwrap();
    let c = client_with(FakeHomeserver::new(), dir, |config| config.autorun.enabled = true).await;
    let alice = c.login("alice").await;

    let view = c.services.open_chat(&alice, &test_room_id("room")).unwrap();
    let services = &c.services;
    eventually("autorun aliases", || async move {
        services.commands.alias("greet").is_some() && services.commands.alias("h").is_some()
    })
    .await;
    // A failing line does not stop the rest
    assert!(view_contains(&view, "(command-not-found)").await);

    c.services.eval(view.clone(), "/alias -r greet").await.unwrap();
    let other = c.services.open_chat(&alice, &test_room_id("other")).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(c.services.commands.alias("greet").is_none());
    assert!(!view_contains(&other, "(command-not-found)").await);
}
