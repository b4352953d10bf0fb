// =============================================================================
// Harmony Matrix Client - Library Crate
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Event-to-UI pipeline of a multi-account Matrix client: sync listeners,
//   the event router, per-room message queues, chat view reconciliation,
//   outgoing message rendering and the composer command language.
//
// =============================================================================

// Re-export common types
pub use ruma;
pub use tokio;
pub use tracing;

// Re-export workspace crates
pub use harmony_core as core;
pub use harmony_core::{HarmonyConfig, HarmonyError, Result};

pub mod markdown;
pub mod service;
pub mod test_utils;
pub mod transport;
pub mod ui;

pub use service::Services;
pub use transport::HttpSessionFactory;
pub use ui::{Notification, RenderUpdate, UiEvent, UiReceiver, UiSender};
