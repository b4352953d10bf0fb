//! End-to-end tests of the event-to-UI pipeline against the in-memory
//! homeserver: sync → router → room queues → chat view.

mod common;

use common::{client, eventually};
use harmony::{
    core::now_millis,
    service::display::FetchOutcome,
    test_utils::{joined_batch, message_event, test_room_id, test_user_id},
    Notification, RenderUpdate, UiEvent,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_sync_events_render_once() {
    let c = client().await;
    let alice = c.login("alice").await;
    let room = test_room_id("room");
    let view = c.services.open_chat(&alice, &room).unwrap();

    let event = message_event("$dup:example.org", &alice, now_millis(), "once");
    c.server.push_batch(&alice, joined_batch(&room, None, vec![event.clone()]));
    c.server.push_batch(&alice, joined_batch(&room, None, vec![event]));

    let view = &view;
    eventually("the message", || async move { view.inspect(|d| d.len()).await == 1 }).await;
    // Give a second copy every chance to show up
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(view.inspect(|d| d.len()).await, 1);

    let new_messages = c
        .events()
        .into_iter()
        .filter(|e| matches!(e, UiEvent::Notification(Notification::NewMessage { .. })))
        .count();
    assert_eq!(new_messages, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_messages_are_ordered_by_timestamp() {
    let c = client().await;
    let alice = c.login("alice").await;
    let bob = test_user_id("bob");
    let room = test_room_id("room");
    let view = c.services.open_chat(&alice, &room).unwrap();

    let now = now_millis();
    let events = vec![
        message_event("$c:example.org", &bob, now + 3, "third"),
        message_event("$a:example.org", &bob, now + 1, "first"),
        message_event("$b:example.org", &bob, now + 2, "second"),
    ];
    c.server.push_batch(&alice, joined_batch(&room, None, events));

    let view = &view;
    eventually("three messages", || async move { view.inspect(|d| d.len()).await == 3 }).await;
    let ids = view.inspect(|d| d.event_ids()).await;
    assert_eq!(
        ids,
        vec![
            Some("$a:example.org".to_owned()),
            Some("$b:example.org".to_owned()),
            Some("$c:example.org".to_owned())
        ]
    );

    // Same sender within the grouping window: one header for the run
    let (groups, second_header) = view.inspect(|d| (d.groups(), d.shows_header(1))).await;
    assert_eq!(groups, vec![0..3]);
    assert!(!second_header);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_echo_is_confirmed_not_duplicated() {
    let c = client().await;
    let alice = c.login("alice").await;
    let room = test_room_id("room");
    c.server.join(&room, &alice);
    let view = c.services.open_chat(&alice, &room).unwrap();

    view.send_markdown("**hello** world").unwrap();

    let server = &c.server;
    eventually("the send", || async move { server.sent().len() == 1 }).await;
    let sent = c.server.sent().remove(0);
    assert_eq!(sent.body, "**hello** world");
    assert!(sent.html.contains("<strong>hello</strong>"), "{}", sent.html);

    let view = &view;
    eventually("the confirmation", || async move { view.pending_echoes() == 0 }).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let ids = view.inspect(|d| d.event_ids()).await;
    assert_eq!(ids, vec![Some(sent.event_id.to_string())]);
    let confirmed = c
        .events()
        .into_iter()
        .any(|e| matches!(e, UiEvent::Render { update: RenderUpdate::Confirmed { index: 0, .. }, .. }));
    assert!(confirmed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_history_is_fetched_in_one_request() {
    let c = client().await;
    let alice = c.login("alice").await;
    let bob = test_user_id("bob");
    let room = test_room_id("room");
    let old = now_millis() - 3_600_000;
    c.server.set_history(
        &room,
        (0..3)
            .map(|n| message_event(&format!("$h{n}:example.org"), &bob, old + n, &format!("old {n}")))
            .collect(),
    );

    let view = c.services.open_chat(&alice, &room).unwrap();
    let view = &view;
    eventually("history to run out", || async move { view.history_exhausted() }).await;
    eventually("three history messages", || async move { view.inspect(|d| d.len()).await == 3 }).await;

    assert_eq!(c.server.messages_calls(), 1);
    let ids = view.inspect(|d| d.event_ids()).await;
    assert_eq!(ids[0].as_deref(), Some("$h0:example.org"));
    assert_eq!(ids[2].as_deref(), Some("$h2:example.org"));

    // Nothing left to ask for
    assert!(matches!(view.load_history(100).await.unwrap(), FetchOutcome::Exhausted));
    assert_eq!(c.server.messages_calls(), 1);

    let exhausted = c
        .events()
        .into_iter()
        .any(|e| matches!(e, UiEvent::Render { update: RenderUpdate::HistoryExhausted, .. }));
    assert!(exhausted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn history_and_live_messages_interleave() {
    let c = client().await;
    let alice = c.login("alice").await;
    let bob = test_user_id("bob");
    let room = test_room_id("room");
    let old = now_millis() - 3_600_000;
    c.server
        .set_history(&room, vec![message_event("$old:example.org", &bob, old, "old")]);

    let view = c.services.open_chat(&alice, &room).unwrap();
    c.server.push_batch(
        &alice,
        joined_batch(&room, None, vec![message_event("$new:example.org", &bob, now_millis(), "new")]),
    );

    let view = &view;
    eventually("both messages", || async move { view.inspect(|d| d.len()).await == 2 }).await;
    let ids = view.inspect(|d| d.event_ids()).await;
    assert_eq!(
        ids,
        vec![Some("$old:example.org".to_owned()), Some("$new:example.org".to_owned())]
    );
    // An hour apart: the later message starts a new group behind a separator
    assert!(view.inspect(|d| d.is_separated(1)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_sends_are_printed_into_the_view() {
    let c = client().await;
    let alice = c.login("alice").await;
    let room = test_room_id("room");
    c.server.set_fail_send(true);
    let view = c.services.open_chat(&alice, &room).unwrap();

    view.send_markdown("doomed").unwrap();

    let view = &view;
    eventually("the error line", || async move {
        view.inspect(|d| (0..d.len()).any(|i| d.html(i).is_some_and(|h| h.contains("Sending failed"))))
            .await
    })
    .await;
    assert_eq!(view.pending_echoes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reopened_view_shows_the_room_again() {
    let c = client().await;
    let alice = c.login("alice").await;
    let bob = test_user_id("bob");
    let room = test_room_id("room");
    let old = now_millis() - 3_600_000;
    let mut history: Vec<_> = (0..3)
        .map(|n| message_event(&format!("$h{n}:example.org"), &bob, old + n, &format!("old {n}")))
        .collect();
    c.server.set_history(&room, history.clone());

    let view = c.services.open_chat(&alice, &room).unwrap();
    {
        let view = &view;
        eventually("the first view to fill", || async move { view.inspect(|d| d.len()).await == 3 }).await;
    }
    let live = message_event("$live:example.org", &bob, now_millis(), "live");
    history.push(live.clone());
    c.server.set_history(&room, history);
    c.server.push_batch(&alice, joined_batch(&room, None, vec![live]));
    {
        let view = &view;
        eventually("the live message", || async move { view.inspect(|d| d.len()).await == 4 }).await;
    }
    assert!(c.services.close_chat(&alice, &room));

    let reopened = c.services.open_chat(&alice, &room).unwrap();
    let reopened = &reopened;
    eventually("the reopened view to fill", || async move {
        reopened.inspect(|d| d.len()).await == 4
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let ids = reopened.inspect(|d| d.event_ids()).await;
    assert_eq!(
        ids,
        vec![
            Some("$h0:example.org".to_owned()),
            Some("$h1:example.org".to_owned()),
            Some("$h2:example.org".to_owned()),
            Some("$live:example.org".to_owned())
        ]
    );
    assert!(reopened.history_exhausted());
}
