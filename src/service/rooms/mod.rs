// =============================================================================
// Harmony Matrix Client - Room Directory Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Per-account room snapshots. A room joined by two of our accounts is two
//   independent entries, keyed by (account, room). Holds the state needed to
//   name a room and the backward pagination cursor.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex as StdMutex,
};

use ruma::{events::room::member::MembershipState, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tracing::debug;

type RoomKey = (OwnedUserId, OwnedRoomId);

/// Membership snapshot of one user in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub membership: MembershipState,
}

/// State events that can change a room's display name.
#[derive(Debug, Clone, PartialEq)]
pub enum RenameKind {
    Name(Option<String>),
    CanonicalAlias(Option<String>),
    Aliases(Vec<String>),
}

/// What the client knows about one room for one account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomInfo {
    pub name: Option<String>,
    pub canonical_alias: Option<String>,
    pub aliases: Vec<String>,
    pub members: BTreeMap<OwnedUserId, Member>,
    /// `prev_batch` of the first timeline seen for the room
    pub prev_batch: Option<String>,
    /// Continuation token returned by the last history page
    pub history_token: Option<String>,
    pub reached_end: bool,
    /// `NewRoom` was published
    pub announced: bool,
    /// A chat view was opened on the room
    pub viewed: bool,
}

/// Cursor for the next history request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    pub token: Option<String>,
    pub reached_end: bool,
}

impl RoomInfo {
    /// Display names of joined and invited members other than `me`.
    pub fn other_member_names(&self, me: &UserId) -> Vec<String> {
        self.members
            .iter()
            .filter(|(id, m)| {
                id.as_str() != me.as_str()
                    && matches!(m.membership, MembershipState::Join | MembershipState::Invite)
            })
            .map(|(id, m)| {
                m.display_name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| id.to_string())
            })
            .collect()
    }

    /// Name from explicit state only: name, canonical alias, first alias.
    pub fn explicit_name(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| self.canonical_alias.clone())
            .or_else(|| self.aliases.first().cloned())
    }
}

/// Name a room after its members.
pub fn computed_name(mut names: Vec<String>) -> String {
    names.sort();
    match names.len() {
        0 => "Empty room".to_owned(),
        1 => names.remove(0),
        2 => format!("{} and {}", names[0], names[1]),
        n => format!("{} and {} others", names[0], n - 1),
    }
}

/// Room snapshots of all accounts.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: StdMutex<HashMap<RoomKey, RoomInfo>>,
}

fn key(user_id: &UserId, room_id: &RoomId) -> RoomKey {
    (user_id.to_owned(), room_id.to_owned())
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, user_id: &UserId, room_id: &RoomId, f: impl FnOnce(&mut RoomInfo) -> R) -> R {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        f(rooms.entry(key(user_id, room_id)).or_default())
    }

    /// Read access to one room snapshot.
    pub fn with_room<R>(&self, user_id: &UserId, room_id: &RoomId, f: impl FnOnce(&RoomInfo) -> R) -> Option<R> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.get(&key(user_id, room_id)).map(f)
    }

    /// Mark the room as announced. Returns true exactly once per pair.
    pub fn announce(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        self.with_entry(user_id, room_id, |info| !std::mem::replace(&mut info.announced, true))
    }

    pub fn is_announced(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        self.with_room(user_id, room_id, |info| info.announced)
            .unwrap_or(false)
    }

    /// Remember where backward pagination starts. The first token wins, and
    /// none is taken once a view pages the room.
    pub fn note_prev_batch(&self, user_id: &UserId, room_id: &RoomId, token: Option<&str>) {
        let Some(token) = token else { return };
        self.with_entry(user_id, room_id, |info| {
            if info.prev_batch.is_none() && !info.viewed {
                info.prev_batch = Some(token.to_owned());
            }
        });
    }

    /// Apply a name-affecting state change. Returns true if something changed.
    pub fn apply_rename(&self, user_id: &UserId, room_id: &RoomId, rename: &RenameKind) -> bool {
        self.with_entry(user_id, room_id, |info| match rename {
            RenameKind::Name(name) => replace_if_changed(&mut info.name, name.clone()),
            RenameKind::CanonicalAlias(alias) => replace_if_changed(&mut info.canonical_alias, alias.clone()),
            RenameKind::Aliases(aliases) => replace_if_changed(&mut info.aliases, aliases.clone()),
        })
    }

    /// Apply a membership change. Returns true if the member entry changed.
    pub fn apply_member(&self, user_id: &UserId, room_id: &RoomId, member_id: &UserId, member: Member) -> bool {
        self.with_entry(user_id, room_id, |info| {
            let previous = info.members.insert(member_id.to_owned(), member.clone());
            previous.as_ref() != Some(&member)
        })
    }

    pub fn pagination(&self, user_id: &UserId, room_id: &RoomId) -> Pagination {
        self.with_room(user_id, room_id, |info| Pagination {
            token: info.history_token.clone().or_else(|| info.prev_batch.clone()),
            reached_end: info.reached_end,
        })
        .unwrap_or(Pagination {
            token: None,
            reached_end: false,
        })
    }

    /// Note that a view opens on the room. A view that was open before
    /// drained the queues, so its successor pages from the newest event
    /// again. Returns true in that case.
    pub fn begin_viewing(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        self.with_entry(user_id, room_id, |info| {
            if !std::mem::replace(&mut info.viewed, true) {
                return false;
            }
            info.prev_batch = None;
            info.history_token = None;
            info.reached_end = false;
            true
        })
    }

    /// Store the cursor returned by a history page.
    pub fn record_page(&self, user_id: &UserId, room_id: &RoomId, next: Option<String>, reached_end: bool) {
        self.with_entry(user_id, room_id, |info| {
            if next.is_some() {
                info.history_token = next;
            }
            info.reached_end |= reached_end;
        });
        if reached_end {
            debug!("✅ History of {} exhausted for {}", room_id, user_id);
        }
    }

    pub fn snapshot(&self, user_id: &UserId, room_id: &RoomId) -> Option<RoomInfo> {
        self.with_room(user_id, room_id, RoomInfo::clone)
    }

    pub fn rooms_of(&self, user_id: &UserId) -> Vec<OwnedRoomId> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = rooms
            .keys()
            .filter(|(user, _)| user.as_str() == user_id.as_str())
            .map(|(_, room)| room.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn remove_room(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.remove(&key(user_id, room_id)).is_some()
    }

    pub fn remove_account(&self, user_id: &UserId) -> usize {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let before = rooms.len();
        rooms.retain(|(user, _), _| user.as_str() != user_id.as_str());
        before - rooms.len()
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{room_id, user_id};
    use test_log::test;

    fn member(name: &str, membership: MembershipState) -> Member {
        Member {
            display_name: Some(name.to_owned()),
            avatar_url: None,
            membership,
        }
    }

    #[test]
    fn announce_fires_once_per_account_and_room() {
        let dir = RoomDirectory::new();
        let room = room_id!("!r:example.org");
        let alice = user_id!("@alice:example.org");
        let bob = user_id!("@bob:example.org");

        assert!(dir.announce(alice, room));
        assert!(!dir.announce(alice, room));
        assert!(dir.announce(bob, room));
        assert_eq!(dir.rooms_of(alice), vec![room.to_owned()]);
    }

    #[test]
    fn computed_names_follow_member_count() {
        assert_eq!(computed_name(vec![]), "Empty room");
        assert_eq!(computed_name(vec!["Bob".into()]), "Bob");
        assert_eq!(computed_name(vec!["Zoe".into(), "Bob".into()]), "Bob and Zoe");
        assert_eq!(
            computed_name(vec!["Zoe".into(), "Bob".into(), "Max".into()]),
            "Bob and 2 others"
        );
    }

    #[test]
    fn other_members_exclude_self_and_leavers() {
        let dir = RoomDirectory::new();
        let room = room_id!("!r:example.org");
        let me = user_id!("@me:example.org");
        dir.apply_member(me, room, me, member("Me", MembershipState::Join));
        dir.apply_member(me, room, user_id!("@a:example.org"), member("Ann", MembershipState::Join));
        dir.apply_member(me, room, user_id!("@b:example.org"), member("Ben", MembershipState::Leave));

        let names = dir.with_room(me, room, |info| info.other_member_names(me)).unwrap();
        assert_eq!(names, vec!["Ann".to_owned()]);
    }

    #[test]
    fn pagination_prefers_history_token() {
        let dir = RoomDirectory::new();
        let room = room_id!("!r:example.org");
        let me = user_id!("@me:example.org");
        dir.note_prev_batch(me, room, Some("p1"));
        dir.note_prev_batch(me, room, Some("p2"));
        assert_eq!(dir.pagination(me, room).token.as_deref(), Some("p1"));

        dir.record_page(me, room, Some("h1".into()), false);
        assert_eq!(dir.pagination(me, room).token.as_deref(), Some("h1"));

        dir.record_page(me, room, None, true);
        let page = dir.pagination(me, room);
        assert!(page.reached_end);
        assert_eq!(page.token.as_deref(), Some("h1"));
    }

    #[test]
    fn reopening_a_room_restarts_pagination() {
        let dir = RoomDirectory::new();
        let room = room_id!("!r:example.org");
        let me = user_id!("@me:example.org");
        dir.note_prev_batch(me, room, Some("p1"));

        assert!(!dir.begin_viewing(me, room));
        assert_eq!(dir.pagination(me, room).token.as_deref(), Some("p1"));
        dir.record_page(me, room, None, true);
        assert!(dir.pagination(me, room).reached_end);

        assert!(dir.begin_viewing(me, room));
        assert_eq!(
            dir.pagination(me, room),
            Pagination {
                token: None,
                reached_end: false
            }
        );
        dir.note_prev_batch(me, room, Some("p2"));
        assert_eq!(dir.pagination(me, room).token, None);
    }

    #[test]
    fn rename_reports_changes_only() {
        let dir = RoomDirectory::new();
        let room = room_id!("!r:example.org");
        let me = user_id!("@me:example.org");
        let rename = RenameKind::Name(Some("Lobby".into()));
        assert!(dir.apply_rename(me, room, &rename));
        assert!(!dir.apply_rename(me, room, &rename));
        assert_eq!(dir.snapshot(me, room).unwrap().explicit_name().as_deref(), Some("Lobby"));
    }
}
