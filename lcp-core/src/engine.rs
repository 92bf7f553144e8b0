//! Engine lifecycle: identity normalization, component wiring, worker
//! start/stop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::discovery::Discovery;
use crate::identity::UserId;
use crate::messaging::Messaging;
use crate::store::{HistoryStore, PeerStore};
use crate::wire::LCP_PORT;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("socket setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine parameters. The UI only ever supplies `user_id` and
/// optionally `broadcast_interval`; the rest has protocol defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_id: String,
    pub broadcast_interval: Duration,
    pub port: u16,
    pub downloads_dir: PathBuf,
}

impl EngineConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        EngineConfig {
            user_id: user_id.into(),
            broadcast_interval: Duration::from_secs(1),
            port: LCP_PORT,
            downloads_dir: PathBuf::from("downloads"),
        }
    }
}

/// Owns every component and the shutdown signal. Workers are
/// daemon-style: they hold no resource that outlives the process, and
/// a shutdown broadcast stops them within one receive cycle.
pub struct Engine {
    local_id: UserId,
    discovery: Arc<Discovery>,
    messaging: Arc<Messaging>,
    history: Arc<dyn HistoryStore>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl Engine {
    /// Construct all components: bind the shared UDP socket (discovery
    /// first), preload the persisted peer snapshot filtered against
    /// local interfaces, then attach messaging to the same socket.
    pub async fn new(
        cfg: EngineConfig,
        peer_store: Arc<dyn PeerStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, EngineError> {
        let local_id = UserId::normalize(cfg.user_id.as_bytes());
        let discovery = Arc::new(Discovery::bind(
            local_id,
            cfg.broadcast_interval,
            cfg.port,
            peer_store.clone(),
        )?);
        match peer_store.load().await {
            Ok(peers) => {
                discovery
                    .peer_table()
                    .preload(peers.into_iter().map(|p| p.into_peer()))
                    .await
            }
            Err(e) => warn!(error = %e, "persisted peer snapshot unreadable, starting empty"),
        }
        let messaging = Arc::new(Messaging::bind(
            discovery.clone(),
            history.clone(),
            cfg.downloads_dir,
            cfg.port,
        ));
        let (shutdown, _) = watch::channel(false);
        Ok(Engine {
            local_id,
            discovery,
            messaging,
            history,
            shutdown,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the background workers: discovery broadcast + persist,
    /// UDP receiver, TCP acceptor, message consumer, pending sweeper.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(self.discovery.clone().broadcast_loop(self.shutdown.subscribe()));
        tokio::spawn(self.discovery.clone().persist_loop(self.shutdown.subscribe()));
        tokio::spawn(self.messaging.clone().udp_recv_loop(self.shutdown.subscribe()));
        tokio::spawn(self.messaging.clone().tcp_accept_loop(self.shutdown.subscribe()));
        tokio::spawn(self.messaging.clone().consumer_loop(self.shutdown.subscribe()));
        tokio::spawn(self.messaging.clone().sweep_loop(self.shutdown.subscribe()));
        info!(id = %self.local_id, ip = %self.discovery.local_ip(), "engine started");
    }

    /// Ask every worker to exit. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    pub fn local_ip(&self) -> std::net::Ipv4Addr {
        self.discovery.local_ip()
    }

    /// Whether the TCP file listener is up.
    pub fn tcp_ok(&self) -> bool {
        self.messaging.tcp_ok()
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn messaging(&self) -> &Arc<Messaging> {
        &self.messaging
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::Peer;
    use crate::store::{MemoryHistoryStore, MemoryPeerStore, PersistedPeer, PeerStatus};
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn config(user_id: &str) -> EngineConfig {
        EngineConfig {
            port: 0,
            ..EngineConfig::new(user_id)
        }
    }

    async fn engine_with_store(user_id: &str, store: Arc<MemoryPeerStore>) -> Engine {
        Engine::new(
            config(user_id),
            store,
            Arc::new(MemoryHistoryStore::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn identity_is_normalized_to_twenty_bytes() {
        let e = engine_with_store(
            "a-very-long-user-id-that-overflows",
            Arc::new(MemoryPeerStore::default()),
        )
        .await;
        assert_eq!(e.local_id().as_bytes().len(), 20);
        assert_eq!(e.local_id(), UserId::from("a-very-long-user-id-"));
    }

    #[tokio::test]
    async fn persisted_peers_are_preloaded_with_local_filter() {
        let store = Arc::new(MemoryPeerStore::default());
        let now = Utc::now();
        store
            .save(&[
                PersistedPeer {
                    id: UserId::from("bob"),
                    ip: Ipv4Addr::new(192, 168, 77, 5),
                    last_seen: now,
                    status: PeerStatus::Connected,
                },
                // Points back at ourselves; must be filtered on load.
                PersistedPeer {
                    id: UserId::from("ghost"),
                    ip: Ipv4Addr::LOCALHOST,
                    last_seen: now,
                    status: PeerStatus::Connected,
                },
            ])
            .await
            .unwrap();

        let e = engine_with_store("alice", store).await;
        let peers = e.discovery().get_peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(
            peers.get(&UserId::from("bob")),
            Some(&Peer {
                ip: Ipv4Addr::new(192, 168, 77, 5),
                last_seen: now,
                tcp_ok: true,
            })
        );
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_stops_workers() {
        let e = engine_with_store("alice", Arc::new(MemoryPeerStore::default())).await;
        e.start();
        e.start();
        assert!(e.tcp_ok());
        e.shutdown();
        e.shutdown();
    }
}
