//! Configuration module for Harmony
//!
//! Configuration is layered with figment: built-in defaults, then an optional
//! TOML file, then `HARMONY_` environment variables (`__` separates nested
//! keys, e.g. `HARMONY_HISTORY__BATCH=50`).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{error::HarmonyError, Result, MAX_HISTORY_BATCH};

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonyConfig {
    /// Remembered accounts (JSON)
    pub accounts_file: PathBuf,
    /// Directory for event logs and the error log
    pub data_dir: PathBuf,
    /// Default tracing filter
    pub log: String,
    /// Capacity of the channel feeding the UI thread
    pub ui_channel_capacity: usize,
    pub login: LoginConfig,
    pub sync: SyncConfig,
    pub router: RouterConfig,
    pub display: DisplayConfig,
    pub history: HistoryConfig,
    pub event_log: EventLogConfig,
    pub errors: ErrorLogConfig,
    pub autorun: AutorunConfig,
}

/// Login configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Network timeout of the login handshake in seconds
    pub timeout_secs: u64,
    /// Concurrent login/logout network calls
    pub workers: usize,
    /// Device display name sent with the login
    pub device_name: String,
}

/// Sync listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Long-poll timeout in milliseconds
    pub timeout_ms: u64,
    /// Timeline events per room in the initial sync
    pub timeline_limit: u32,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
}

/// Event router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Concurrent queue hand-offs
    pub handoff_workers: usize,
    /// Attempts to find a room queue before creating it
    pub enqueue_retries: u32,
    /// Base delay between attempts, doubled each time
    pub enqueue_backoff_ms: u64,
}

/// Display reconciler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Same-sender messages closer than this share one header
    pub group_window_secs: u64,
    /// Gaps longer than this get a visual separator
    pub separation_secs: u64,
    /// Distance from the bottom still considered "pinned"
    pub pin_tolerance_px: u32,
    pub line_height_px: u32,
    pub header_height_px: u32,
    pub separator_height_px: u32,
    /// Used to estimate wrapped line counts
    pub chars_per_line: usize,
    /// Unconfirmed local echoes are forgotten after this long
    pub echo_ttl_secs: u64,
    /// Open chat views kept alive
    pub view_cache_size: usize,
}

/// History pagination configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Batch used while the content does not fill the viewport
    pub initial_batch: u16,
    /// Batch used when the user scrolls to the top
    pub batch: u16,
    pub poll_interval_ms: u64,
    pub start_delay_ms: u64,
}

/// Event logger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Replace an already logged event with the same id
    pub allow_overwrite: bool,
}

/// Error log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorLogConfig {
    pub log_file: PathBuf,
}

/// Commands run when the first chat view opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutorunConfig {
    pub enabled: bool,
    /// JSON list of command lines, created with defaults when missing
    pub file: PathBuf,
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("harmony")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("harmony")
}

impl Default for HarmonyConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            accounts_file: default_config_dir().join("accounts.json"),
            event_log: EventLogConfig {
                dir: data_dir.join("events"),
                ..EventLogConfig::default()
            },
            errors: ErrorLogConfig {
                log_file: data_dir.join("errors.log"),
            },
            data_dir,
            log: "info".to_string(),
            ui_channel_capacity: 1024,
            login: LoginConfig::default(),
            sync: SyncConfig::default(),
            router: RouterConfig::default(),
            display: DisplayConfig::default(),
            history: HistoryConfig::default(),
            autorun: AutorunConfig::default(),
        }
    }
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            workers: 8,
            device_name: "harmony".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            timeline_limit: 10,
            reconnect_backoff_ms: 1_000,
            max_reconnect_backoff_ms: 30_000,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handoff_workers: 8,
            enqueue_retries: 5,
            enqueue_backoff_ms: 50,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            group_window_secs: 300,
            separation_secs: 900,
            pin_tolerance_px: 10,
            line_height_px: 18,
            header_height_px: 22,
            separator_height_px: 12,
            chars_per_line: 80,
            echo_ttl_secs: 120,
            view_cache_size: 32,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            initial_batch: 25,
            batch: MAX_HISTORY_BATCH,
            poll_interval_ms: 100,
            start_delay_ms: 250,
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_data_dir().join("events"),
            allow_overwrite: true,
        }
    }
}

impl Default for ErrorLogConfig {
    fn default() -> Self {
        Self {
            log_file: default_data_dir().join("errors.log"),
        }
    }
}

impl Default for AutorunConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: default_config_dir().join("autorun.json"),
        }
    }
}

impl HarmonyConfig {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment.
    #[instrument(level = "debug")]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        debug!("🔧 Loading configuration");

        let mut figment = Figment::from(Serialized::defaults(HarmonyConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(HarmonyError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("HARMONY_").split("__"));

        let config: HarmonyConfig = figment.extract()?;
        config.validate()?;

        info!("✅ Configuration loaded");
        Ok(config)
    }

    /// Reject values that would stall or break the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.ui_channel_capacity == 0 {
            return Err(HarmonyError::Config("ui_channel_capacity must be > 0".into()));
        }
        if self.login.workers == 0 || self.router.handoff_workers == 0 {
            return Err(HarmonyError::Config("worker counts must be > 0".into()));
        }
        for (name, batch) in [
            ("history.initial_batch", self.history.initial_batch),
            ("history.batch", self.history.batch),
        ] {
            if batch == 0 || batch > MAX_HISTORY_BATCH {
                return Err(HarmonyError::Config(format!(
                    "{name} must be between 1 and {MAX_HISTORY_BATCH}, got {batch}"
                )));
            }
        }
        if self.display.chars_per_line == 0 {
            return Err(HarmonyError::Config("display.chars_per_line must be > 0".into()));
        }
        Ok(())
    }
}

impl LoginConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl HistoryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }
}

impl DisplayConfig {
    pub fn echo_ttl(&self) -> Duration {
        Duration::from_secs(self.echo_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_log::test;

    #[test]
    fn defaults_are_valid() {
        let config = HarmonyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.history.batch, 100);
        assert_eq!(config.display.group_window_secs, 300);
        assert!(config.accounts_file.ends_with("harmony/accounts.json"));
        assert!(config.autorun.enabled);
        assert!(config.autorun.file.ends_with("harmony/autorun.json"));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log = \"debug\"\n[history]\nbatch = 40").unwrap();

        let config = HarmonyConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.log, "debug");
        assert_eq!(config.history.batch, 40);
        assert_eq!(config.history.initial_batch, 25);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let mut config = HarmonyConfig::default();
        config.history.batch = 500;
        assert!(matches!(config.validate(), Err(HarmonyError::Config(_))));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = HarmonyConfig::load(Some(Path::new("/nonexistent/harmony.toml"))).unwrap_err();
        assert_eq!(err.kind_label(), "config");
    }
}
