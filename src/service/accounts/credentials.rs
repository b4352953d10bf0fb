//! Remembered accounts.
//!
//! A JSON array at `accounts_file`. The password is obfuscated, not
//! encrypted: this file is a "remember me" convenience, not a secret store.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use harmony_core::{HarmonyError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One remembered account, password in clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub server_url: String,
    pub user_id: String,
    pub password: String,
    pub device_name: Option<String>,
}

/// On-disk shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredCredential {
    server_url: String,
    user_id: String,
    password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
}

pub fn encode_password(password: &str) -> String {
    STANDARD.encode(STANDARD.encode(password.as_bytes()))
}

pub fn decode_password(encoded: &str) -> Result<String> {
    let invalid = |e: &dyn std::fmt::Display| HarmonyError::Credentials(format!("undecodable password: {e}"));
    let once = STANDARD.decode(encoded.trim()).map_err(|e| invalid(&e))?;
    let twice = STANDARD.decode(&once).map_err(|e| invalid(&e))?;
    String::from_utf8(twice).map_err(|e| invalid(&e))
}

impl From<&Credential> for StoredCredential {
    fn from(credential: &Credential) -> Self {
        Self {
            server_url: credential.server_url.clone(),
            user_id: credential.user_id.clone(),
            password: encode_password(&credential.password),
            device_name: credential.device_name.clone(),
        }
    }
}

impl TryFrom<StoredCredential> for Credential {
    type Error = HarmonyError;

    fn try_from(stored: StoredCredential) -> Result<Self> {
        Ok(Self {
            password: decode_password(&stored.password)?,
            server_url: stored.server_url,
            user_id: stored.user_id,
            device_name: stored.device_name,
        })
    }
}

fn read_file(path: &Path) -> Result<Vec<StoredCredential>> {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| HarmonyError::Credentials(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write `value` as JSON to a temp file next to `path`, then rename over it.
pub(crate) fn write_json_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&serde_json::to_vec_pretty(value)?)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| HarmonyError::Io(e.error))?;
    Ok(())
}

/// Credential file with one writer at a time.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialStore {
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
            .map_err(|e| HarmonyError::Internal(format!("credential task failed: {e}")))?
    }

    /// All remembered accounts. A missing file is an empty list.
    pub async fn read(&self) -> Result<Vec<Credential>> {
        let _guard = self.lock.lock().await;
        let stored = self.blocking(|path| read_file(&path)).await?;
        stored.into_iter().map(Credential::try_from).collect()
    }

    /// Insert or replace (by user id) one account.
    pub async fn add(&self, credential: Credential) -> Result<()> {
        let _guard = self.lock.lock().await;
        let user_id = credential.user_id.clone();
        self.blocking(move |path| {
            let mut entries = read_file(&path)?;
            let stored = StoredCredential::from(&credential);
            match entries.iter_mut().find(|e| e.user_id == stored.user_id) {
                Some(existing) => *existing = stored,
                None => entries.push(stored),
            }
            write_json_file(&path, &entries)
        })
        .await?;
        info!("✅ Remembered {}", user_id);
        Ok(())
    }

    /// Forget one account. Returns whether it was remembered.
    pub async fn remove(&self, user_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let user_id = user_id.to_owned();
        let removed = self
            .blocking(move |path| {
                let mut entries = read_file(&path)?;
                let before = entries.len();
                entries.retain(|e| e.user_id != user_id);
                if entries.len() == before {
                    return Ok(false);
                }
                write_json_file(&path, &entries)?;
                Ok(true)
            })
            .await?;
        debug!("🔧 Credential removal: {}", removed);
        Ok(removed)
    }
}
