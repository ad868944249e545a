//! # Pairing State Persistence
//!
//! The link core persists a small record so background reconnection survives an
//! app restart: the last paired radio, whether auto-reconnect is enabled, and
//! whether the LoRa region has been configured.
//!
//! Persistence is a collaborator behind the [`PairingStore`] trait. Two
//! implementations ship with the crate:
//!
//! - [`MemoryStore`] - process-local, used by tests and the simulator
//! - [`JsonFileStore`] - a single JSON document written atomically (temp file +
//!   rename) while holding an exclusive `fs2` lock on the destination
//!
//! ```rust,no_run
//! use meshlink::storage::{JsonFileStore, PairingStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = JsonFileStore::new("data/link_state.json");
//!     let state = store.load().await?;
//!     println!("paired: {:?}", state.target);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::protocol::RegionCode;
use crate::transport::TargetDevice;

/// Everything the link core persists between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedLink {
    #[serde(default)]
    pub target: Option<TargetDevice>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub region_configured: bool,
    #[serde(default)]
    pub region: Option<RegionCode>,
}

fn default_true() -> bool {
    true
}

impl Default for PersistedLink {
    fn default() -> Self {
        Self {
            target: None,
            auto_reconnect: true,
            region_configured: false,
            region: None,
        }
    }
}

#[async_trait]
pub trait PairingStore: Send + Sync {
    async fn load(&self) -> Result<PersistedLink, StoreError>;
    async fn save(&self, state: &PersistedLink) -> Result<(), StoreError>;
}

/// Apply `f` to the persisted record and write it back.
pub async fn update<S, F>(store: &S, f: F) -> Result<PersistedLink, StoreError>
where
    S: PairingStore + ?Sized,
    F: FnOnce(&mut PersistedLink) + Send,
{
    let mut state = store.load().await?;
    f(&mut state);
    store.save(&state).await?;
    Ok(state)
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<PersistedLink>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedLink) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl PairingStore for MemoryStore {
    async fn load(&self) -> Result<PersistedLink, StoreError> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, state: &PersistedLink) -> Result<(), StoreError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
        Ok(())
    }
}

/// JSON document on disk. A missing file loads as the default record.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `content` to `path` with exclusive locking and an atomic rename.
    fn write_file_locked(path: &Path, content: &str) -> Result<(), StoreError> {
        use std::fs::{self, File, OpenOptions};
        use std::io::Write;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // fs2 locks are synchronous; hold one on the destination for the swap.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        lock_file.lock_exclusive()?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let base = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("link_state.json");
        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(mut tmp) => {
                    tmp.write_all(content.as_bytes())?;
                    tmp.flush()?;
                    let _ = tmp.sync_all();
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                    continue;
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        };

        fs::rename(&tmp_path, path)?;
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
        let _ = lock_file.unlock();
        Ok(())
    }
}

#[async_trait]
impl PairingStore for JsonFileStore {
    async fn load(&self) -> Result<PersistedLink, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                // Guard against leading NULs from an interrupted write
                let cleaned = content.trim_start_matches('\0').trim();
                if cleaned.is_empty() {
                    return Ok(PersistedLink::default());
                }
                Ok(serde_json::from_str(cleaned)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No link state at {}; starting fresh", self.path.display());
                Ok(PersistedLink::default())
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn save(&self, state: &PersistedLink) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(state)?;
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || Self::write_file_locked(&path, &content)).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Link state writer task failed: {}", e);
                Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ProtocolKind;

    #[tokio::test]
    async fn memory_store_update() {
        let store = MemoryStore::new();
        assert_eq!(store.load().await.unwrap(), PersistedLink::default());
        let updated = update(&store, |s| {
            s.target = Some(TargetDevice::new("AA", "Meshtastic_aaaa", ProtocolKind::Ble));
            s.auto_reconnect = false;
        })
        .await
        .unwrap();
        assert_eq!(store.load().await.unwrap(), updated);
        assert!(!updated.auto_reconnect);
    }

    #[tokio::test]
    async fn json_store_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/state.json"));
        assert_eq!(store.load().await.unwrap(), PersistedLink::default());
    }

    #[tokio::test]
    async fn json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let state = PersistedLink {
            target: Some(TargetDevice::new("/dev/ttyUSB0", "RAK4631", ProtocolKind::Serial)),
            auto_reconnect: true,
            region_configured: true,
            region: Some(RegionCode::Eu868),
        };
        JsonFileStore::new(&path).save(&state).await.unwrap();
        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.load().await.unwrap(), state);
        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn json_store_tolerates_nul_prefix_and_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "\0\0{\"region_configured\": true}").unwrap();
        let loaded = JsonFileStore::new(&path).load().await.unwrap();
        assert!(loaded.region_configured);
        assert!(loaded.auto_reconnect);
        assert!(loaded.target.is_none());
    }
}
