//! Peer records and the lock-guarded liveness table.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::identity::UserId;

/// A peer is reported offline once its last probe reply is older than this.
pub const OFFLINE_THRESHOLD_SECS: i64 = 20;

/// A discovered peer: where to reach it and when it was last heard from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub last_seen: DateTime<Utc>,
    /// Updated from the outcome of outbound TCP transfers.
    pub tcp_ok: bool,
}

impl Peer {
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen <= Duration::seconds(OFFLINE_THRESHOLD_SECS)
    }
}

/// In-memory map of known peers. The local node's own id never appears,
/// and entries resolving to a local interface IP are rejected.
pub struct PeerTable {
    local_id: UserId,
    local_ips: HashSet<Ipv4Addr>,
    inner: Mutex<HashMap<UserId, Peer>>,
}

impl PeerTable {
    pub fn new(local_id: UserId, local_ips: HashSet<Ipv4Addr>) -> Self {
        PeerTable {
            local_id,
            local_ips,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the table from persisted state, dropping self entries and
    /// entries that point back at one of our own interfaces.
    pub async fn preload(&self, peers: impl IntoIterator<Item = (UserId, Peer)>) {
        let mut table = self.inner.lock().await;
        for (id, peer) in peers {
            if id == self.local_id || id.is_broadcast() || self.local_ips.contains(&peer.ip) {
                continue;
            }
            table.insert(id, peer);
        }
    }

    /// Record a sighting of `id` at `ip`. Stale entries holding the same
    /// IP under a different id are evicted; `last_seen` never moves
    /// backwards.
    pub async fn upsert(&self, id: UserId, ip: Ipv4Addr, seen: DateTime<Utc>) {
        if id == self.local_id || id.is_broadcast() || self.local_ips.contains(&ip) {
            return;
        }
        let mut table = self.inner.lock().await;
        table.retain(|uid, peer| peer.ip != ip || *uid == id);
        let entry = table.entry(id).or_insert(Peer {
            ip,
            last_seen: seen,
            tcp_ok: true,
        });
        entry.ip = ip;
        if seen > entry.last_seen {
            entry.last_seen = seen;
        }
    }

    pub async fn get(&self, id: &UserId) -> Option<Peer> {
        self.inner.lock().await.get(id).cloned()
    }

    /// Current view, with local-IP entries filtered out.
    pub async fn snapshot(&self) -> HashMap<UserId, Peer> {
        self.inner
            .lock()
            .await
            .iter()
            .filter(|(_, peer)| !self.local_ips.contains(&peer.ip))
            .map(|(id, peer)| (*id, peer.clone()))
            .collect()
    }

    pub async fn set_tcp_ok(&self, id: &UserId, ok: bool) {
        if let Some(peer) = self.inner.lock().await.get_mut(id) {
            peer.tcp_ok = ok;
        }
    }
}
