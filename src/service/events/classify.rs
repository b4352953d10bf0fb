//! Classification of raw protocol events into [`ProtocolEvent`].
//!
//! This is the only place that looks at `type` strings and content keys;
//! everything downstream matches on the variants.

use harmony_core::{HarmonyError, RawEvent, Result};
use ruma::{
    events::room::member::MembershipState, OwnedRoomId, OwnedUserId, RoomId, UserId,
};
use serde_json::Value;

use crate::service::rooms::{Member, RenameKind};

/// A membership update.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberChange {
    pub user_id: OwnedUserId,
    pub member: Member,
    /// `content` differs from `unsigned.prev_content`
    pub changed: bool,
}

/// Every kind of inbound event the pipeline reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// `m.room.message`, headed for a room queue
    Message { room_id: OwnedRoomId, event: RawEvent },
    /// Name, canonical alias or alias list changed
    Rename { room_id: OwnedRoomId, rename: RenameKind },
    Member { room_id: OwnedRoomId, change: MemberChange },
    /// Other state (topic, power levels, …): tracked, not rendered
    State { room_id: OwnedRoomId, event_type: String },
    /// Known room event with nothing to render (redactions, reactions, …)
    Ignored { room_id: OwnedRoomId, event_type: String },
    Invite {
        room_id: OwnedRoomId,
        state: Vec<RawEvent>,
    },
    Leave { room_id: OwnedRoomId },
    Presence {
        sender: String,
        presence: String,
        status_msg: Option<String>,
    },
    Ephemeral {
        room_id: OwnedRoomId,
        event_type: String,
        content: Value,
    },
}

impl ProtocolEvent {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolEvent::Message { .. } => "message",
            ProtocolEvent::Rename { .. } => "rename",
            ProtocolEvent::Member { .. } => "member",
            ProtocolEvent::State { .. } => "state",
            ProtocolEvent::Ignored { .. } => "ignored",
            ProtocolEvent::Invite { .. } => "invite",
            ProtocolEvent::Leave { .. } => "leave",
            ProtocolEvent::Presence { .. } => "presence",
            ProtocolEvent::Ephemeral { .. } => "ephemeral",
        }
    }
}

/// Room event types that are expected and deliberately not rendered.
const IGNORED_TYPES: &[&str] = &[
    "m.room.redaction",
    "m.reaction",
    "m.sticker",
    "m.call.invite",
    "m.call.answer",
    "m.call.hangup",
    "m.call.candidates",
];

fn optional_string(content: &Value, key: &str) -> Option<String> {
    content
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Member snapshot from a `m.room.member` content object.
pub fn member_from_content(content: &Value) -> Member {
    Member {
        display_name: optional_string(content, "displayname"),
        avatar_url: optional_string(content, "avatar_url"),
        membership: MembershipState::from(
            content
                .get("membership")
                .and_then(Value::as_str)
                .unwrap_or("leave"),
        ),
    }
}

/// Classify a timeline or state event of `room_id`.
pub fn classify_room_event(room_id: &RoomId, raw: RawEvent) -> Result<ProtocolEvent> {
    let room_id = room_id.to_owned();
    let event = match (raw.event_type.as_str(), raw.state_key.as_deref()) {
        ("m.room.message", None) => ProtocolEvent::Message { room_id, event: raw },
        ("m.room.name", Some(_)) => ProtocolEvent::Rename {
            room_id,
            rename: RenameKind::Name(optional_string(&raw.content, "name")),
        },
        ("m.room.canonical_alias", Some(_)) => ProtocolEvent::Rename {
            room_id,
            rename: RenameKind::CanonicalAlias(optional_string(&raw.content, "alias")),
        },
        ("m.room.aliases", Some(_)) => {
            let aliases = raw
                .content
                .get("aliases")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            ProtocolEvent::Rename {
                room_id,
                rename: RenameKind::Aliases(aliases),
            }
        }
        ("m.room.member", Some(state_key)) => {
            let user_id = UserId::parse(state_key).map_err(|e| {
                HarmonyError::MalformedEvent(format!("bad member state_key {state_key:?}: {e}"))
            })?;
            let changed = raw.prev_content() != Some(&raw.content);
            ProtocolEvent::Member {
                room_id,
                change: MemberChange {
                    user_id,
                    member: member_from_content(&raw.content),
                    changed,
                },
            }
        }
        (event_type, Some(_)) => ProtocolEvent::State {
            room_id,
            event_type: event_type.to_owned(),
        },
        (event_type, None) if IGNORED_TYPES.contains(&event_type) => ProtocolEvent::Ignored {
            room_id,
            event_type: event_type.to_owned(),
        },
        (event_type, None) => {
            return Err(HarmonyError::UnsupportedEvent {
                event_type: event_type.to_owned(),
                payload: raw.payload(),
            })
        }
    };
    Ok(event)
}

/// Classify an ephemeral (typing, receipt) event.
pub fn classify_ephemeral(room_id: &RoomId, raw: RawEvent) -> ProtocolEvent {
    ProtocolEvent::Ephemeral {
        room_id: room_id.to_owned(),
        event_type: raw.event_type,
        content: raw.content,
    }
}

/// Classify a presence event.
pub fn classify_presence(raw: RawEvent) -> Result<ProtocolEvent> {
    let sender = raw
        .sender
        .clone()
        .ok_or_else(|| HarmonyError::MalformedEvent(format!("presence without sender: {}", raw.payload())))?;
    Ok(ProtocolEvent::Presence {
        sender,
        presence: optional_string(&raw.content, "presence").unwrap_or_else(|| "offline".to_owned()),
        status_msg: optional_string(&raw.content, "status_msg"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::room_id;
    use serde_json::json;
    use test_log::test;

    fn raw(value: Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn messages_and_renames() {
        let room = room_id!("!r:example.org");
        let message = classify_room_event(
            room,
            raw(json!({"type": "m.room.message", "event_id": "$1", "content": {"msgtype": "m.text", "body": "hi"}})),
        )
        .unwrap();
        assert_eq!(message.label(), "message");

        let rename = classify_room_event(
            room,
            raw(json!({"type": "m.room.name", "state_key": "", "content": {"name": " Lobby "}})),
        )
        .unwrap();
        assert_eq!(
            rename,
            ProtocolEvent::Rename {
                room_id: room.to_owned(),
                rename: RenameKind::Name(Some("Lobby".into()))
            }
        );
    }

    #[test]
    fn member_change_compares_prev_content() {
        let room = room_id!("!r:example.org");
        let same = classify_room_event(
            room,
            raw(json!({
                "type": "m.room.member", "state_key": "@a:example.org",
                "content": {"membership": "join"},
                "unsigned": {"prev_content": {"membership": "join"}}
            })),
        )
        .unwrap();
        let ProtocolEvent::Member { change, .. } = same else { panic!("not a member event") };
        assert!(!change.changed);
        assert_eq!(change.member.membership, MembershipState::Join);

        let renamed = classify_room_event(
            room,
            raw(json!({
                "type": "m.room.member", "state_key": "@a:example.org",
                "content": {"membership": "join", "displayname": "Ann"},
                "unsigned": {"prev_content": {"membership": "join"}}
            })),
        )
        .unwrap();
        let ProtocolEvent::Member { change, .. } = renamed else { panic!("not a member event") };
        assert!(change.changed);
        assert_eq!(change.member.display_name.as_deref(), Some("Ann"));
    }

    #[test]
    fn unknown_timeline_events_are_unsupported() {
        let err = classify_room_event(
            room_id!("!r:example.org"),
            raw(json!({"type": "m.room.encrypted", "event_id": "$1", "content": {"algorithm": "x"}})),
        )
        .unwrap_err();
        match err {
            HarmonyError::UnsupportedEvent { event_type, payload } => {
                assert_eq!(event_type, "m.room.encrypted");
                assert!(payload.contains("\"algorithm\""));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_member_state_key_is_malformed() {
        let err = classify_room_event(
            room_id!("!r:example.org"),
            raw(json!({"type": "m.room.member", "state_key": "not-a-user", "content": {}})),
        )
        .unwrap_err();
        assert_eq!(err.kind_label(), "malformed-event");
    }
}
