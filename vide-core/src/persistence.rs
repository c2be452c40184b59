//! Project persistence
//!
//! Atomic JSON storage for networks, memory entries, and the first-run
//! flag. Every write goes through the temp-file-plus-rename helper and is
//! serialized per file, so readers never observe partial state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::network::AgentNetwork;

/// Write `value` as pretty JSON via a temp file and rename.
///
/// The rename is the commit point: on failure the destination is untouched.
pub async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Persistence(format!("no parent directory for {}", path.display())))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Persistence(format!("serialize {}: {}", path.display(), e)))?;

    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string()),
        Uuid::new_v4()
    ));
    tokio::fs::write(&tmp, json.as_bytes())
        .await
        .map_err(|e| Error::Persistence(format!("write {}: {}", tmp.display(), e)))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::Persistence(format!(
            "rename {} -> {}: {}",
            tmp.display(),
            path.display(),
            e
        )));
    }
    Ok(())
}

/// Read and parse a JSON file; `None` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| Error::Persistence(format!("parse {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Persistence(e.to_string())),
    }
}

/// Per-path write locks, handed out on demand.
#[derive(Default)]
struct PathLocks {
    locks: parking_lot::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }
}

/// Storage for persisted networks under
/// `<configRoot>/projects/<encoded>/networks/`.
pub struct NetworkStore {
    root: PathBuf,
    locks: PathLocks,
}

impl NetworkStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: PathLocks::default(),
        }
    }

    pub fn path_for(&self, network_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", network_id))
    }

    pub async fn save(&self, network: &AgentNetwork) -> Result<()> {
        let path = self.path_for(&network.id);
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;
        atomic_write_json(&path, network).await
    }

    pub async fn load(&self, network_id: &str) -> Result<Option<AgentNetwork>> {
        read_json(&self.path_for(network_id)).await
    }

    /// All persisted networks, newest first by `last_active_at`.
    pub async fn list(&self) -> Result<Vec<AgentNetwork>> {
        let mut networks: Vec<AgentNetwork> = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(networks),
            Err(e) => return Err(Error::Persistence(e.to_string())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<AgentNetwork>(&path).await {
                Ok(Some(network)) => networks.push(network),
                Ok(None) => {}
                Err(e) => log::warn!("skipping unreadable network file {}: {}", path.display(), e),
            }
        }
        networks.sort_by(|a, b| {
            b.last_active_at
                .unwrap_or(b.created_at)
                .cmp(&a.last_active_at.unwrap_or(a.created_at))
        });
        Ok(networks)
    }

    pub async fn delete(&self, network_id: &str) -> Result<bool> {
        let path = self.path_for(network_id);
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Persistence(e.to_string())),
        }
    }
}

/// One remembered key/value pair in the per-project memory file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-project memory persistence (`memory.json`).
///
/// # Example
///
/// ```rust
/// use vide_core::persistence::MemoryStore;
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// let store = MemoryStore::new(dir.path().join("memory.json"));
///
/// // Upsert replaces any existing value for the key.
/// store.upsert("auth", "uses JWT").await.unwrap();
/// store.upsert("auth", "uses sessions").await.unwrap();
///
/// let entry = store.get("auth").await.unwrap().unwrap();
/// assert_eq!(entry.value, "uses sessions");
/// # });
/// ```
pub struct MemoryStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl MemoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn list(&self) -> Result<Vec<MemoryEntry>> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
        Ok(self.list().await?.into_iter().find(|e| e.key == key))
    }

    /// Insert or replace the entry with `key`.
    pub async fn upsert(&self, key: &str, value: &str) -> Result<MemoryEntry> {
        let _guard = self.lock.lock().await;
        let mut entries: Vec<MemoryEntry> = read_json(&self.path).await?.unwrap_or_default();
        let entry = match entries.iter_mut().find(|e| e.key == key) {
            Some(existing) => {
                existing.value = value.to_string();
                existing.updated_at = Some(Utc::now());
                existing.clone()
            }
            None => {
                let entry = MemoryEntry {
                    key: key.to_string(),
                    value: value.to_string(),
                    created_at: Utc::now(),
                    updated_at: None,
                };
                entries.push(entry.clone());
                entry
            }
        };
        atomic_write_json(&self.path, &entries).await?;
        Ok(entry)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut entries: Vec<MemoryEntry> = read_json(&self.path).await?.unwrap_or_default();
        let before = entries.len();
        entries.retain(|e| e.key != key);
        let removed = entries.len() < before;
        if removed {
            atomic_write_json(&self.path, &entries).await?;
        }
        Ok(removed)
    }
}

/// First-run sentinel under the config root.
pub struct FirstRunFlag {
    path: PathBuf,
}

impl FirstRunFlag {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn is_first_run(&self) -> bool {
        !self.path.exists()
    }

    pub async fn mark_complete(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Persistence(e.to_string()))?;
        }
        tokio::fs::write(&self.path, b"")
            .await
            .map_err(|e| Error::Persistence(e.to_string()))
    }
}
