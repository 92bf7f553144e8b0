//! JSON-file persistence: a peer snapshot and an append-only history
//! log. Saves go through a temp file and rename so a crash mid-write
//! never corrupts the previous state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use lcp_core::{HistoryEntry, HistoryStore, PeerStore, PersistedPeer, StoreError};

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir).await?;
        }
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Reads a JSON file into `T`, treating a missing or unreadable file
/// as empty state rather than an error.
async fn read_or_default<T: Default + serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "unreadable state file, starting empty");
            T::default()
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Peer snapshot in a single JSON file.
pub struct JsonPeerStore {
    path: PathBuf,
}

impl JsonPeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonPeerStore { path: path.into() }
    }
}

#[async_trait]
impl PeerStore for JsonPeerStore {
    async fn load(&self) -> Result<Vec<PersistedPeer>, StoreError> {
        read_or_default(&self.path).await
    }

    async fn save(&self, peers: &[PersistedPeer]) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(peers).map_err(|e| StoreError::Format(e.to_string()))?;
        write_atomic(&self.path, &bytes).await
    }
}

/// History log in a single JSON array. Appends are read-modify-write,
/// serialized by a lock so concurrent workers cannot interleave.
pub struct JsonHistoryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonHistoryStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn append(&self, entry: HistoryEntry) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries: Vec<HistoryEntry> = read_or_default(&self.path).await?;
        entries.push(entry);
        let bytes =
            serde_json::to_vec_pretty(&entries).map_err(|e| StoreError::Format(e.to_string()))?;
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn append_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.append(HistoryEntry::Message {
            from: from.into(),
            to: to.into(),
            text: text.into(),
            ts,
        })
        .await
    }

    async fn append_file(
        &self,
        from: &str,
        to: &str,
        filename: &str,
        size: u64,
        path: &Path,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.append(HistoryEntry::File {
            from: from.into(),
            to: to.into(),
            filename: filename.into(),
            size,
            path: path.to_path_buf(),
            ts,
        })
        .await
    }

    async fn get_conversation(&self, a: &str, b: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let entries: Vec<HistoryEntry> = read_or_default(&self.path).await?;
        Ok(entries.into_iter().filter(|e| e.involves(a, b)).collect())
    }
}
