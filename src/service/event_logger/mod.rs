// =============================================================================
// Harmony Matrix Client - Event Logger Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Optional on-disk journal of every unique room event, one JSON file per
//   room and UTC day. A single writer task owns the files.
//
// Architecture:
//   • <dir>/<base64url(room id)>/<yyyy-mm-dd>.json
//   • Entries sorted by origin_server_ts
//   • Same event id replaces the stored entry when overwriting is allowed
//   • Atomic writes (temp file + rename)
//
// =============================================================================

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{TimeZone, Utc};
use harmony_core::{config::EventLogConfig, HarmonyError, RawEvent, Result};
use ruma::{OwnedRoomId, RoomId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{accounts::credentials::write_json_file, errors::ErrorReporter};

const QUEUE_CAPACITY: usize = 1024;

/// Handle to the writer task.
#[derive(Debug, Clone)]
pub struct EventLogger {
    tx: mpsc::Sender<(OwnedRoomId, RawEvent)>,
}

impl EventLogger {
    /// Start the writer task.
    pub fn spawn(config: EventLogConfig, errors: Arc<ErrorReporter>) -> Self {
        let (tx, mut rx) = mpsc::channel::<(OwnedRoomId, RawEvent)>(QUEUE_CAPACITY);
        info!("🚀 Event logger writing to {}", config.dir.display());

        tokio::spawn(async move {
            while let Some((room_id, event)) = rx.recv().await {
                let dir = config.dir.clone();
                let overwrite = config.allow_overwrite;
                let written =
                    tokio::task::spawn_blocking(move || write_event(&dir, &room_id, &event, overwrite))
                        .await
                        .map_err(|e| HarmonyError::Internal(e.to_string()))
                        .and_then(|r| r);
                if let Err(e) = written {
                    errors.report("event_logger", &e);
                }
            }
            debug!("🔧 Event logger stopped");
        });

        Self { tx }
    }

    /// Queue an event for writing. Never blocks the caller.
    pub fn log(&self, room_id: &RoomId, event: &RawEvent) {
        if let Err(e) = self.tx.try_send((room_id.to_owned(), event.clone())) {
            warn!("⚠️ Event log queue unavailable, skipping event: {}", e);
        }
    }
}

/// File holding `event` for `room_id`.
pub fn log_path(dir: &Path, room_id: &RoomId, event: &RawEvent) -> PathBuf {
    let day = event
        .origin_server_ts
        .and_then(|ts| Utc.timestamp_millis_opt(ts).single())
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d");
    dir.join(URL_SAFE_NO_PAD.encode(room_id.as_str()))
        .join(format!("{day}.json"))
}

/// Merge `event` into its day file.
pub fn write_event(dir: &Path, room_id: &RoomId, event: &RawEvent, allow_overwrite: bool) -> Result<()> {
    let path = log_path(dir, room_id, event);
    let parent = path
        .parent()
        .ok_or_else(|| HarmonyError::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut events: Vec<RawEvent> = match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    match events
        .iter_mut()
        .find(|e| e.event_id.is_some() && e.event_id == event.event_id)
    {
        Some(existing) if allow_overwrite => *existing = event.clone(),
        Some(_) => return Ok(()),
        None => events.push(event.clone()),
    }
    events.sort_by_key(|e| e.origin_server_ts.unwrap_or_default());

    write_json_file(&path, &events)
}
