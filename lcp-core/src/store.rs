//! Persistence ports consumed by the engine. Implementations decide the
//! backing format; the engine only requires crash-safe saves.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::UserId;
use crate::peers::Peer;

/// Recipient label used for broadcast traffic in the history log.
pub const GLOBAL_RECIPIENT: &str = "*global*";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store format error: {0}")]
    Format(String),
}

/// Connectivity status derived from `last_seen` at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connected,
    Disconnected,
}

/// One peer as it appears in a persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPeer {
    pub id: UserId,
    pub ip: Ipv4Addr,
    pub last_seen: DateTime<Utc>,
    pub status: PeerStatus,
}

impl PersistedPeer {
    pub fn from_peer(id: UserId, peer: &Peer, now: DateTime<Utc>) -> Self {
        PersistedPeer {
            id,
            ip: peer.ip,
            last_seen: peer.last_seen,
            status: if peer.is_online(now) {
                PeerStatus::Connected
            } else {
                PeerStatus::Disconnected
            },
        }
    }

    pub fn into_peer(self) -> (UserId, Peer) {
        (
            self.id,
            Peer {
                ip: self.ip,
                last_seen: self.last_seen,
                tcp_ok: true,
            },
        )
    }
}

/// Peer snapshot storage. `load` runs once at engine construction;
/// `save` runs every persist-loop tick and must be crash-safe
/// (write-to-temp + rename).
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn load(&self) -> Result<Vec<PersistedPeer>, StoreError>;
    async fn save(&self, peers: &[PersistedPeer]) -> Result<(), StoreError>;
}

/// One entry in the append-only history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HistoryEntry {
    Message {
        from: String,
        to: String,
        text: String,
        ts: DateTime<Utc>,
    },
    File {
        from: String,
        to: String,
        filename: String,
        size: u64,
        path: PathBuf,
        ts: DateTime<Utc>,
    },
}

impl HistoryEntry {
    pub fn from(&self) -> &str {
        match self {
            HistoryEntry::Message { from, .. } | HistoryEntry::File { from, .. } => from,
        }
    }

    pub fn to(&self) -> &str {
        match self {
            HistoryEntry::Message { to, .. } | HistoryEntry::File { to, .. } => to,
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            HistoryEntry::Message { ts, .. } | HistoryEntry::File { ts, .. } => *ts,
        }
    }

    /// Whether this entry belongs to the conversation between `a` and `b`.
    /// Global traffic is visible in every conversation regardless of who
    /// sent it; querying with `b == "*global*"` returns the global feed
    /// alone.
    pub fn involves(&self, a: &str, b: &str) -> bool {
        let (from, to) = (self.from(), self.to());
        if to == GLOBAL_RECIPIENT {
            return true;
        }
        if a == GLOBAL_RECIPIENT || b == GLOBAL_RECIPIENT {
            return false;
        }
        (from == a && to == b) || (from == b && to == a)
    }
}

/// Append-only history log with participant-pair queries.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn append_file(
        &self,
        from: &str,
        to: &str,
        filename: &str,
        size: u64,
        path: &Path,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Entries between `a` and `b` in append order.
    async fn get_conversation(&self, a: &str, b: &str) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Volatile [`PeerStore`] for tests and UI-less embedding.
#[derive(Default)]
pub struct MemoryPeerStore {
    inner: tokio::sync::Mutex<Vec<PersistedPeer>>,
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn load(&self) -> Result<Vec<PersistedPeer>, StoreError> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, peers: &[PersistedPeer]) -> Result<(), StoreError> {
        *self.inner.lock().await = peers.to_vec();
        Ok(())
    }
}

/// Volatile [`HistoryStore`] counterpart.
#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: tokio::sync::Mutex<Vec<HistoryEntry>>,
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.lock().await.push(HistoryEntry::Message {
            from: from.into(),
            to: to.into(),
            text: text.into(),
            ts,
        });
        Ok(())
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
        self.inner.lock().await.push(HistoryEntry::File {
            from: from.into(),
            to: to.into(),
            filename: filename.into(),
            size,
            path: path.to_path_buf(),
            ts,
        });
        Ok(())
    }

    async fn get_conversation(&self, a: &str, b: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .iter()
            .filter(|e| e.involves(a, b))
            .cloned()
            .collect())
    }
}
