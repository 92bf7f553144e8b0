//! LAN discovery: periodic Echo broadcasts, reply handling, liveness
//! table upkeep, snapshot persistence.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::identity::UserId;
use crate::peers::PeerTable;
use crate::store::{PeerStore, PersistedPeer};
use crate::wire::{self, Header, OpCode, Response, Status};

/// Send and receive buffer size for both sockets.
pub(crate) const SOCKET_BUF_BYTES: usize = 262_144;

/// Cadence of the peer snapshot persist loop.
const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

/// Maintains the peer table by broadcasting Echo probes and absorbing
/// replies. Shares its UDP socket with the messaging layer; only the
/// messaging receiver reads from it and dispatches back in here.
pub struct Discovery {
    local_id: UserId,
    sock: Arc<UdpSocket>,
    peers: Arc<PeerTable>,
    store: Arc<dyn PeerStore>,
    local_ip: Ipv4Addr,
    local_ips: HashSet<Ipv4Addr>,
    broadcast_addr: Ipv4Addr,
    interval: Duration,
    port: u16,
}

impl Discovery {
    /// Select a local address, bind the shared UDP socket and build the
    /// (initially empty) peer table. `port` 0 binds an ephemeral port.
    pub fn bind(
        local_id: UserId,
        interval: Duration,
        port: u16,
        store: Arc<dyn PeerStore>,
    ) -> std::io::Result<Self> {
        let (local_ip, local_ips) = select_local_ip();
        let broadcast_addr = subnet_broadcast(local_ip);
        debug!(%local_ip, %broadcast_addr, "selected local address");

        let std_sock = match bind_udp(local_ip, port) {
            Ok(s) => s,
            Err(e) => {
                warn!(%local_ip, error = %e, "bind failed, falling back to 0.0.0.0");
                bind_udp(Ipv4Addr::UNSPECIFIED, port)?
            }
        };
        let sock = UdpSocket::from_std(std_sock)?;

        Ok(Discovery {
            peers: Arc::new(PeerTable::new(local_id, local_ips.clone())),
            local_id,
            sock: Arc::new(sock),
            store,
            local_ip,
            local_ips,
            broadcast_addr,
            interval,
            port,
        })
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn local_ips(&self) -> &HashSet<Ipv4Addr> {
        &self.local_ips
    }

    pub(crate) fn socket(&self) -> Arc<UdpSocket> {
        self.sock.clone()
    }

    pub(crate) fn peer_table(&self) -> Arc<PeerTable> {
        self.peers.clone()
    }

    /// Current peer view (local-IP entries filtered).
    pub async fn get_peers(&self) -> std::collections::HashMap<UserId, crate::peers::Peer> {
        self.peers.snapshot().await
    }

    /// Immediately re-send the discovery probe.
    pub async fn force_discover(&self) {
        self.send_probe().await;
    }

    fn probe_frame(&self) -> [u8; wire::HEADER_LEN] {
        wire::encode_header(&Header {
            from: self.local_id,
            to: UserId::BROADCAST,
            op: OpCode::Echo,
            body_id: 0,
            body_len: 0,
        })
    }

    /// One Echo broadcast to the subnet-directed address and to the
    /// limited broadcast address. Send errors are logged and swallowed;
    /// the next tick retries.
    async fn send_probe(&self) {
        let frame = self.probe_frame();
        for dest in [self.broadcast_addr, Ipv4Addr::BROADCAST] {
            let addr = SocketAddrV4::new(dest, self.port);
            if let Err(e) = self.sock.send_to(&frame, SocketAddr::V4(addr)).await {
                warn!(%addr, error = %e, "broadcast probe failed");
            }
        }
    }

    /// An Echo header from another node: answer with a unicast `OK`
    /// carrying our id, then record the sender.
    pub(crate) async fn handle_echo(&self, hdr: &Header, from: SocketAddr) {
        let SocketAddr::V4(from) = from else { return };
        if self.local_ips.contains(from.ip()) || hdr.from == self.local_id {
            return;
        }
        let resp = wire::encode_response(Status::Ok, self.local_id);
        if let Err(e) = self.sock.send_to(&resp, SocketAddr::V4(from)).await {
            warn!(peer = %hdr.from, error = %e, "echo reply failed");
            return;
        }
        self.peers.upsert(hdr.from, *from.ip(), Utc::now()).await;
        trace!(peer = %hdr.from, ip = %from.ip(), "peer seen via echo");
    }

    /// An `OK` response that no ack waiter claimed: treat as an
    /// Echo reply and record the responder.
    pub(crate) async fn handle_response(&self, resp: &Response, from: SocketAddr) {
        let SocketAddr::V4(from) = from else { return };
        if resp.status != Status::Ok
            || self.local_ips.contains(from.ip())
            || resp.responder == self.local_id
        {
            return;
        }
        self.peers
            .upsert(resp.responder, *from.ip(), Utc::now())
            .await;
        trace!(peer = %resp.responder, ip = %from.ip(), "peer seen via reply");
    }

    /// Worker B: probe on every interval tick until shutdown.
    pub(crate) async fn broadcast_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.send_probe().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("broadcast loop stopped");
    }

    /// Worker P: snapshot the table every 5 s and hand it to the store.
    pub(crate) async fn persist_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.persist_once().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("persist loop stopped");
    }

    async fn persist_once(&self) {
        let now = Utc::now();
        let snapshot: Vec<PersistedPeer> = self
            .peers
            .snapshot()
            .await
            .iter()
            .map(|(id, peer)| PersistedPeer::from_peer(*id, peer, now))
            .collect();
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(error = %e, "peer snapshot save failed");
        }
    }
}

fn bind_udp(ip: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_broadcast(true)?;
    // Kernel may clamp these; the requested size is advisory.
    let _ = sock.set_recv_buffer_size(SOCKET_BUF_BYTES);
    let _ = sock.set_send_buffer_size(SOCKET_BUF_BYTES);
    sock.set_nonblocking(true)?;
    sock.bind(&SocketAddrV4::new(ip, port).into())?;
    Ok(sock.into())
}

/// Source address the kernel would route toward `target`. No packet is
/// sent; connecting a UDP socket only fixes the route.
fn probe_source_ip(target: SocketAddrV4) -> Option<Ipv4Addr> {
    let sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    sock.connect(target).ok()?;
    match sock.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

/// Pick the address to bind: prefer the 192.168.1.0/24 LAN, then any
/// non-loopback route, then loopback. Returns the choice plus the full
/// candidate set (always including loopback) used to filter self entries.
fn select_local_ip() -> (Ipv4Addr, HashSet<Ipv4Addr>) {
    let probes = [
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 80),
        SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 80),
    ];
    let mut candidates = Vec::new();
    for target in probes {
        if let Some(ip) = probe_source_ip(target) {
            if !candidates.contains(&ip) {
                candidates.push(ip);
            }
        }
    }

    let chosen = candidates
        .iter()
        .find(|ip| ip.octets()[..3] == [192, 168, 1])
        .or_else(|| candidates.iter().find(|ip| !ip.is_loopback()))
        .or(candidates.first())
        .copied()
        .unwrap_or(Ipv4Addr::LOCALHOST);

    let mut local_ips: HashSet<Ipv4Addr> = candidates.into_iter().collect();
    local_ips.insert(Ipv4Addr::LOCALHOST);
    (chosen, local_ips)
}

/// Subnet-directed broadcast under the /24 heuristic the probes use.
fn subnet_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    if ip.is_loopback() {
        return Ipv4Addr::BROADCAST;
    }
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}
