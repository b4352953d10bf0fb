//! Commands run when the first chat view opens.
//!
//! A JSON list of command lines at `autorun.file`. A missing file is
//! created with [`DEFAULT_COMMANDS`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use harmony_core::{HarmonyError, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{eval, parse, CommandContext, Parsed};
use crate::service::accounts::credentials::write_json_file;

pub const DEFAULT_COMMANDS: &[&str] = &["/alias /h /help"];

fn defaults() -> Vec<String> {
    DEFAULT_COMMANDS.iter().map(|c| (*c).to_owned()).collect()
}

fn read_file(path: &Path) -> Result<Vec<String>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| HarmonyError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let commands = defaults();
            write_json_file(path, &commands)?;
            debug!("🔧 Created {} with default commands", path.display());
            Ok(commands)
        }
        Err(e) => Err(e.into()),
    }
}

/// Autorun file with one writer at a time.
#[derive(Debug)]
pub struct AutorunStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AutorunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || f(path))
            .await
            .map_err(|e| HarmonyError::Internal(format!("autorun task failed: {e}")))?
    }

    pub async fn read(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        self.blocking(|path| read_file(&path)).await
    }

    /// Append `commands` and return the whole list.
    pub async fn add(&self, commands: Vec<String>) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        self.blocking(move |path| {
            let mut all = read_file(&path)?;
            all.extend(commands);
            write_json_file(&path, &all)?;
            Ok(all)
        })
        .await
    }

    /// Replace the file with the default commands.
    pub async fn reset(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        self.blocking(|path| {
            let commands = defaults();
            write_json_file(&path, &commands)?;
            Ok(commands)
        })
        .await
    }
}

fn is_autorun(line: &str) -> bool {
    matches!(parse(line), Parsed::Command { name, .. } if name == "autorun")
}

/// Evaluate `commands` in order. Failures are printed into the view and do
/// not stop the remaining commands.
#[instrument(level = "debug", skip(ctx, commands))]
pub async fn run_commands(ctx: &CommandContext, commands: &[String]) -> usize {
    let mut failed = 0;
    for line in commands {
        if is_autorun(line) {
            warn!("⚠️ Skipping nested autorun command {:?}", line);
            continue;
        }
        if eval(ctx.clone(), line).await.is_err() {
            failed += 1;
        }
    }
    failed
}

/// Run the stored commands once, in the first opened view.
pub async fn run_startup(ctx: CommandContext) {
    let commands = match ctx.services.autorun.read().await {
        Ok(commands) => commands,
        Err(e) => {
            ctx.services.errors.report("autorun", &e);
            return;
        }
    };
    let failed = run_commands(&ctx, &commands).await;
    info!("✅ Ran {} autorun commands ({} failed)", commands.len(), failed);
}
