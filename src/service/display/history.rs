//! Backward pagination for one chat view.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use harmony_core::{Direction, HarmonyError, Result, MAX_HISTORY_BATCH};
use ruma::{OwnedRoomId, OwnedUserId};
use tracing::{debug, instrument};

use crate::service::{
    events::{EventOrigin, EventRouter},
    rooms::RoomDirectory,
};

/// Result of one `fetch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched { events: usize, reached_end: bool },
    /// Another fetch is in flight; this trigger was coalesced into it
    Busy,
    /// Nothing left to fetch
    Exhausted,
}

/// Clears the busy flag when the fetch ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fetches older messages of one room and feeds them through the router.
#[derive(Debug)]
pub struct HistoryFetcher {
    user_id: OwnedUserId,
    room_id: OwnedRoomId,
    router: Arc<EventRouter>,
    rooms: Arc<RoomDirectory>,
    busy: AtomicBool,
}

impl HistoryFetcher {
    pub fn new(user_id: OwnedUserId, room_id: OwnedRoomId, router: Arc<EventRouter>, rooms: Arc<RoomDirectory>) -> Self {
        Self {
            user_id,
            room_id,
            router,
            rooms,
            busy: AtomicBool::new(false),
        }
    }

    pub fn reached_end(&self) -> bool {
        self.rooms.pagination(&self.user_id, &self.room_id).reached_end
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Request one page of up to `limit` events older than what was loaded.
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id, room_id = %self.room_id))]
    pub async fn fetch(&self, limit: u16) -> Result<FetchOutcome> {
        if self.reached_end() {
            return Ok(FetchOutcome::Exhausted);
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            return Ok(FetchOutcome::Busy);
        }
        let _in_flight = InFlight(&self.busy);

        let pagination = self.rooms.pagination(&self.user_id, &self.room_id);
        if pagination.reached_end {
            return Ok(FetchOutcome::Exhausted);
        }
        let session = self
            .router
            .session(&self.user_id)
            .ok_or_else(|| HarmonyError::UnknownAccount(self.user_id.to_string()))?;

        let limit = limit.clamp(1, MAX_HISTORY_BATCH);
        let page = session
            .room_messages(&self.room_id, pagination.token.as_deref(), Direction::Backward, limit)
            .await?;

        let events = page.chunk.len();
        // Short pages are normal (servers filter by visibility); only the token ends history
        let reached_end = page.end.is_none() || page.end == pagination.token || events == 0;
        debug!(
            "🔧 History page of {} events for {}, end reached: {}",
            events, self.room_id, reached_end
        );
        self.rooms
            .record_page(&self.user_id, &self.room_id, page.end, reached_end);

        for raw in page.chunk {
            if let Err(e) = self
                .router
                .process_event(&self.user_id, &self.room_id, raw, EventOrigin::Backfill)
                .await
            {
                self.router.report_event_error("history", &e);
            }
        }

        Ok(FetchOutcome::Fetched { events, reached_end })
    }
}
