//! Raw message event → [`ChatMessage`] projection.

use harmony_core::{ChatMessage, HarmonyError, MessageOrigin, QueueKind, RawEvent, Result};
use ruma::{EventId, RoomId, UserId};

use crate::markdown::{normalize_html, render_plain_body};

const HTML_FORMAT: &str = "org.matrix.custom.html";

/// msgtypes rendered as chat text
const TEXT_MSGTYPES: &[&str] = &["m.text", "m.notice", "m.emote"];

/// Project a `m.room.message` event for display by `receiver`.
///
/// All HTML work happens here, once per message.
pub fn to_chat_message(
    receiver: &UserId,
    room_id: &RoomId,
    raw: &RawEvent,
    kind: QueueKind,
) -> Result<ChatMessage> {
    let msgtype = raw.content_str("msgtype").unwrap_or_default();
    if !TEXT_MSGTYPES.contains(&msgtype) {
        return Err(HarmonyError::UnsupportedEvent {
            event_type: format!("{} ({})", raw.event_type, if msgtype.is_empty() { "no msgtype" } else { msgtype }),
            payload: raw.payload(),
        });
    }

    let event_id = raw
        .event_id
        .as_deref()
        .ok_or_else(|| HarmonyError::MalformedEvent(format!("message without event_id: {}", raw.payload())))?;
    let sender = raw
        .sender
        .as_deref()
        .ok_or_else(|| HarmonyError::MalformedEvent(format!("message without sender: {}", raw.payload())))?;
    let timestamp = raw
        .origin_server_ts
        .ok_or_else(|| HarmonyError::MalformedEvent(format!("message without timestamp: {}", raw.payload())))?;

    let body = raw.content_str("body").unwrap_or_default().to_owned();
    let html = match (raw.content_str("format"), raw.content_str("formatted_body")) {
        (Some(HTML_FORMAT), Some(formatted)) => normalize_html(formatted),
        _ => render_plain_body(&body),
    };

    Ok(ChatMessage {
        event_id: Some(EventId::parse(event_id)?),
        sender: UserId::parse(sender)?,
        room_id: room_id.to_owned(),
        receiver: receiver.to_owned(),
        html,
        body,
        timestamp,
        origin: MessageOrigin::from(kind),
        transaction_id: raw.transaction_id().map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{room_id, user_id};
    use serde_json::json;
    use test_log::test;

    fn raw(content: serde_json::Value) -> RawEvent {
        serde_json::from_value(json!({
            "type": "m.room.message",
            "event_id": "$e1",
            "sender": "@bob:example.org",
            "origin_server_ts": 42,
            "content": content,
        }))
        .unwrap()
    }

    #[test]
    fn formatted_body_wins_when_html() {
        let msg = to_chat_message(
            user_id!("@me:example.org"),
            room_id!("!r:example.org"),
            &raw(json!({
                "msgtype": "m.text",
                "body": "**hi**",
                "format": "org.matrix.custom.html",
                "formatted_body": "<strong>hi</strong> <strike>old</strike>"
            })),
            QueueKind::Live,
        )
        .unwrap();
        assert_eq!(msg.html, "<strong>hi</strong> <s>old</s>");
        assert_eq!(msg.body, "**hi**");
        assert_eq!(msg.timestamp, 42);
        assert!(!msg.is_own());
    }

    #[test]
    fn plain_body_is_rendered_as_markdown() {
        let msg = to_chat_message(
            user_id!("@me:example.org"),
            room_id!("!r:example.org"),
            &raw(json!({"msgtype": "m.text", "body": "see https://matrix.org"})),
            QueueKind::Backfill,
        )
        .unwrap();
        assert!(msg.html.contains(r#"<a href="https://matrix.org">"#), "{}", msg.html);
        assert_eq!(msg.origin, MessageOrigin::Backfill);
    }

    #[test]
    fn images_are_unsupported() {
        let err = to_chat_message(
            user_id!("@me:example.org"),
            room_id!("!r:example.org"),
            &raw(json!({"msgtype": "m.image", "body": "cat.png"})),
            QueueKind::Live,
        )
        .unwrap_err();
        assert!(matches!(err, HarmonyError::UnsupportedEvent { .. }));
    }
}
