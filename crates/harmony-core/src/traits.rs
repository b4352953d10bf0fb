//! Protocol boundary traits
//!
//! The pipeline never talks HTTP itself. It drives an authenticated
//! [`MatrixSession`] obtained from a [`SessionFactory`], which keeps the
//! router and display code testable against an in-memory homeserver.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use ruma::{OwnedEventId, RoomId, UserId};

use crate::{
    sync::{MessagesPage, SyncBatch},
    types::Direction,
    Result,
};

/// One authenticated connection to a homeserver.
#[async_trait]
pub trait MatrixSession: Send + Sync + fmt::Debug {
    /// Fully qualified id of the logged-in user
    fn user_id(&self) -> &UserId;

    /// Base URL of the homeserver
    fn homeserver(&self) -> &str;

    /// Long-poll for the next batch of events after `since`.
    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncBatch>;

    /// Send an HTML message. `txn_id` makes retries idempotent and comes
    /// back in the event's `unsigned.transaction_id`.
    async fn send_html(
        &self,
        room_id: &RoomId,
        html: &str,
        body: &str,
        txn_id: &str,
    ) -> Result<OwnedEventId>;

    /// Fetch one page of room history.
    async fn room_messages(
        &self,
        room_id: &RoomId,
        from: Option<&str>,
        dir: Direction,
        limit: u16,
    ) -> Result<MessagesPage>;

    /// Set the user's display name, everywhere or only in `room_id`.
    async fn set_display_name(&self, name: &str, room_id: Option<&RoomId>) -> Result<()>;

    /// Invalidate the access token.
    async fn logout(&self) -> Result<()>;
}

/// Performs password logins.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn login(
        &self,
        server_url: &str,
        user_id: &UserId,
        password: &str,
        device_name: &str,
    ) -> Result<Arc<dyn MatrixSession>>;
}
