//! Harmony Core Library
//!
//! Version: 0.1.0-alpha
//! Date: 2024-12-11
//!
//! Fundamental types shared by every part of the Harmony client: the error
//! taxonomy, the chat message projection, configuration, and the traits that
//! sit at the protocol boundary.
//!
//! # Features
//! - `HarmonyError` and the crate-wide `Result` alias
//! - `ChatMessage`, ordering keys and severities
//! - Figment based configuration loading
//! - `MatrixSession` / `SessionFactory` traits and sync payload types
//!
//! # Examples
//! ```rust
//! use harmony_core::{HarmonyConfig, Result};
//!
//! fn example() -> Result<()> {
//!     let config = HarmonyConfig::default();
//!     config.validate()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod sync;
pub mod traits;
pub mod types;

pub use config::HarmonyConfig;
pub use error::{HarmonyError, Result};
pub use sync::{InvitedRoom, JoinedRoom, MessagesPage, RawEvent, SyncBatch, Unsigned};
pub use traits::{MatrixSession, SessionFactory};
pub use types::{
    now_millis, ChatMessage, Direction, EchoKey, LoginRequest, MessageOrigin, Millis, QueueKind,
    Severity,
};

/// Largest page size a homeserver accepts for `/messages`.
pub const MAX_HISTORY_BATCH: u16 = 100;
