// =============================================================================
// Harmony Matrix Client - Display Name Cache Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Resolves room and user display names once and keeps them in LRU caches.
//   State changes invalidate exactly the entry they affect.
//
// =============================================================================

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use lru::LruCache;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tracing::debug;

use super::rooms::{computed_name, RoomDirectory};

const DEFAULT_CAPACITY: usize = 1024;

/// (account, room)
type RoomNameKey = (OwnedUserId, OwnedRoomId);
/// (account, room, member)
type UserNameKey = (OwnedUserId, OwnedRoomId, OwnedUserId);

/// Cached display names.
#[derive(Debug)]
pub struct DisplayNames {
    rooms: Arc<RoomDirectory>,
    room_names: StdMutex<LruCache<RoomNameKey, String>>,
    user_names: StdMutex<LruCache<UserNameKey, String>>,
    resolutions: AtomicU64,
}

impl DisplayNames {
    pub fn new(rooms: Arc<RoomDirectory>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            rooms,
            room_names: StdMutex::new(LruCache::new(capacity)),
            user_names: StdMutex::new(LruCache::new(capacity)),
            resolutions: AtomicU64::new(0),
        }
    }

    /// How many names were computed rather than served from cache.
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Display name of `room_id` as seen by `user_id`.
    ///
    /// Explicit name, canonical alias, first alias, then a name computed from
    /// the other members. Unknown rooms fall back to the local part of the id.
    pub fn room_name(&self, user_id: &UserId, room_id: &RoomId) -> String {
        let key = (user_id.to_owned(), room_id.to_owned());
        if let Some(name) = self.room_names.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return name.clone();
        }

        self.resolutions.fetch_add(1, Ordering::Relaxed);
        let name = self
            .rooms
            .with_room(user_id, room_id, |info| {
                info.explicit_name()
                    .unwrap_or_else(|| computed_name(info.other_member_names(user_id)))
            })
            .unwrap_or_else(|| fallback_room_name(room_id));
        debug!("🔧 Resolved name of {} for {}: {}", room_id, user_id, name);

        self.room_names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, name.clone());
        name
    }

    /// Display name of `member` in `room_id`, falling back to the user id.
    pub fn user_name(&self, user_id: &UserId, room_id: &RoomId, member: &UserId) -> String {
        let key = (user_id.to_owned(), room_id.to_owned(), member.to_owned());
        if let Some(name) = self.user_names.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return name.clone();
        }

        self.resolutions.fetch_add(1, Ordering::Relaxed);
        let name = self
            .rooms
            .with_room(user_id, room_id, |info| {
                info.members
                    .get(member)
                    .and_then(|m| m.display_name.clone())
                    .filter(|n| !n.trim().is_empty())
            })
            .flatten()
            .unwrap_or_else(|| member.to_string());

        self.user_names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, name.clone());
        name
    }

    pub fn invalidate_room(&self, user_id: &UserId, room_id: &RoomId) {
        let key = (user_id.to_owned(), room_id.to_owned());
        self.room_names.lock().unwrap_or_else(|e| e.into_inner()).pop(&key);
    }

    pub fn invalidate_user(&self, user_id: &UserId, room_id: &RoomId, member: &UserId) {
        let key = (user_id.to_owned(), room_id.to_owned(), member.to_owned());
        self.user_names.lock().unwrap_or_else(|e| e.into_inner()).pop(&key);
    }

    /// Drop every entry of a room, e.g. after leaving it.
    pub fn remove_room(&self, user_id: &UserId, room_id: &RoomId) {
        self.invalidate_room(user_id, room_id);
        let mut users = self.user_names.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<_> = users
            .iter()
            .filter(|((account, room, _), _)| account.as_str() == user_id.as_str() && room.as_str() == room_id.as_str())
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            users.pop(&key);
        }
    }

    pub fn remove_account(&self, user_id: &UserId) {
        let mut rooms = self.room_names.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<_> = rooms
            .iter()
            .filter(|((account, _), _)| account.as_str() == user_id.as_str())
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            rooms.pop(&key);
        }
        drop(rooms);

        let mut users = self.user_names.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<_> = users
            .iter()
            .filter(|((account, _, _), _)| account.as_str() == user_id.as_str())
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            users.pop(&key);
        }
    }
}

/// `!abc:example.org` → `!abc`
fn fallback_room_name(room_id: &RoomId) -> String {
    room_id
        .as_str()
        .split(':')
        .next()
        .unwrap_or(room_id.as_str())
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::rooms::{Member, RenameKind};
    use ruma::{events::room::member::MembershipState, room_id, user_id};
    use test_log::test;

    fn names() -> (Arc<RoomDirectory>, DisplayNames) {
        let rooms = Arc::new(RoomDirectory::new());
        let names = DisplayNames::new(rooms.clone(), 16);
        (rooms, names)
    }

    #[test]
    fn room_name_is_cached_until_invalidated() {
        let (rooms, names) = names();
        let me = user_id!("@me:example.org");
        let room = room_id!("!abc:example.org");
        rooms.apply_rename(me, room, &RenameKind::CanonicalAlias(Some("#lobby:example.org".into())));

        assert_eq!(names.room_name(me, room), "#lobby:example.org");
        rooms.apply_rename(me, room, &RenameKind::Name(Some("Lobby".into())));
        assert_eq!(names.room_name(me, room), "#lobby:example.org");
        assert_eq!(names.resolutions(), 1);

        names.invalidate_room(me, room);
        assert_eq!(names.room_name(me, room), "Lobby");
        assert_eq!(names.resolutions(), 2);
    }

    #[test]
    fn unknown_room_uses_id_local_part() {
        let (_, names) = names();
        assert_eq!(
            names.room_name(user_id!("@me:example.org"), room_id!("!abc:example.org")),
            "!abc"
        );
    }

    #[test]
    fn invalidation_is_per_entry() {
        let (rooms, names) = names();
        let me = user_id!("@me:example.org");
        let room = room_id!("!abc:example.org");
        let ann = user_id!("@ann:example.org");
        let ben = user_id!("@ben:example.org");
        for (id, name) in [(ann, "Ann"), (ben, "Ben")] {
            rooms.apply_member(
                me,
                room,
                id,
                Member {
                    display_name: Some(name.into()),
                    avatar_url: None,
                    membership: MembershipState::Join,
                },
            );
            names.user_name(me, room, id);
        }
        assert_eq!(names.resolutions(), 2);

        names.invalidate_user(me, room, ann);
        names.user_name(me, room, ann);
        names.user_name(me, room, ben);
        assert_eq!(names.resolutions(), 3);
    }

    #[test]
    fn unknown_member_falls_back_to_id() {
        let (_, names) = names();
        let me = user_id!("@me:example.org");
        assert_eq!(
            names.user_name(me, room_id!("!abc:example.org"), user_id!("@x:example.org")),
            "@x:example.org"
        );
    }
}
