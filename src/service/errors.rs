// =============================================================================
// Harmony Matrix Client - Error Reporter Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Where background failures go. Every report is logged, appended to the
//   error log file and shown in the UI; nothing spawned in the background is
//   allowed to fail silently.
//
// =============================================================================

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::Mutex as StdMutex,
};

use chrono::Utc;
use harmony_core::HarmonyError;
use tracing::{error, warn};

use crate::ui::{UiEvent, UiSender};

/// Error sink shared by all services.
#[derive(Debug)]
pub struct ErrorReporter {
    ui: UiSender,
    log_file: Option<PathBuf>,
    file_lock: StdMutex<()>,
}

impl ErrorReporter {
    pub fn new(ui: UiSender, log_file: Option<PathBuf>) -> Self {
        Self {
            ui,
            log_file,
            file_lock: StdMutex::new(()),
        }
    }

    /// Report a failure that happened in `scope`.
    pub fn report(&self, scope: &str, err: &HarmonyError) {
        error!("❌ [{}] {}: {}", scope, err.kind_label(), err);
        self.append_to_log(scope, err);
        self.ui.try_post(UiEvent::Error {
            scope: scope.to_owned(),
            kind: err.kind_label(),
            message: err.to_string(),
        });
    }

    fn append_to_log(&self, scope: &str, err: &HarmonyError) {
        let Some(path) = &self.log_file else { return };
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());

        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(
                file,
                "[{}] {} {}: {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                scope,
                err.kind_label(),
                err
            )
        })();

        if let Err(e) = result {
            warn!("⚠️ Could not write error log {}: {}", path.display(), e);
        }
    }

    /// Callback that reports into `scope`, for APIs taking an error callback.
    pub fn callback(self: &std::sync::Arc<Self>, scope: &'static str) -> impl Fn(&HarmonyError) + Send + Sync + 'static {
        let reporter = self.clone();
        move |err| reporter.report(scope, err)
    }
}
