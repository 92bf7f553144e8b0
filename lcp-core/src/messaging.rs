//! Reliable UDP control messaging and the TCP bulk-file channel.
//!
//! One receiver owns the shared UDP socket and classifies frames by
//! length: responses feed the ack waiter table (falling back to
//! discovery), headers dispatch by op code. File bodies arrive on a
//! separate TCP listener and are matched to their UDP header through
//! the pending-header table, keyed by body id.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::discovery::{Discovery, SOCKET_BUF_BYTES};
use crate::identity::UserId;
use crate::peers::PeerTable;
use crate::store::{HistoryStore, StoreError, GLOBAL_RECIPIENT};
use crate::wire::{self, Header, OpCode, Response, Status, WireError};

/// Default ack wait per attempt.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

const SEND_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Socket-level timeout for body waits and TCP reads.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period between the header ack and the TCP dial, so the
/// receiver has its pending-header entry armed.
const TCP_ARM_DELAY: Duration = Duration::from_millis(500);
const FILE_CHUNK: usize = 32 * 1024;
const PROGRESS_STEP: usize = 1024 * 1024;
const UDP_RECV_BUF: usize = 4096;
const MSG_BODY_BUF: usize = 65536;
const PENDING_TTL_SECS: i64 = 30;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const QUEUE_CAP: usize = 1024;
const MAX_NAME_LEN: usize = 64;

/// Sender-side failures, surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("peer {0} is not known to discovery")]
    UnknownPeer(UserId),
    #[error("no ack from {peer} after {attempts} attempts")]
    DeliveryFailed { peer: UserId, attempts: u32 },
    #[error("file transfer to {peer} failed: {reason}")]
    TransferFailed { peer: UserId, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The most recent outstanding send to a peer. Responses carry no body
/// id, so waiters key on the destination peer; the stored id records
/// which exchange the waiter belongs to.
struct AckWaiter {
    body_id: u8,
    notify: Arc<Notify>,
}

struct InboundMessage {
    from: UserId,
    broadcast: bool,
    text: String,
    ts: DateTime<Utc>,
}

/// Bounded inbound queue: oldest entries drop on overflow.
struct InboundQueue {
    inner: Mutex<VecDeque<InboundMessage>>,
    notify: Notify,
}

impl InboundQueue {
    fn new() -> Self {
        InboundQueue {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    async fn push(&self, msg: InboundMessage) {
        {
            let mut q = self.inner.lock().await;
            if q.len() == QUEUE_CAP {
                q.pop_front();
                warn!("inbound queue full, dropping oldest message");
            }
            q.push_back(msg);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> InboundMessage {
        loop {
            if let Some(msg) = self.inner.lock().await.pop_front() {
                return msg;
            }
            self.notify.notified().await;
        }
    }
}

/// Messaging endpoint: shares the discovery UDP socket, owns the TCP
/// listener, the ack waiters, the pending file headers and the inbound
/// work queue.
pub struct Messaging {
    local_id: UserId,
    sock: Arc<UdpSocket>,
    listener: Option<Arc<TcpListener>>,
    discovery: Arc<Discovery>,
    peers: Arc<PeerTable>,
    history: Arc<dyn HistoryStore>,
    acks: Mutex<HashMap<UserId, AckWaiter>>,
    pending_headers: Mutex<HashMap<u8, (Header, DateTime<Utc>)>>,
    next_body_id: Mutex<u8>,
    queue: InboundQueue,
    downloads_dir: PathBuf,
    port: u16,
    tcp_ok: AtomicBool,
}

impl Messaging {
    /// Build the endpoint over an already-bound discovery socket and
    /// bind the TCP listener. A TCP bind failure leaves the node able
    /// to chat but unable to receive files (`tcp_ok` reports it).
    pub fn bind(
        discovery: Arc<Discovery>,
        history: Arc<dyn HistoryStore>,
        downloads_dir: PathBuf,
        port: u16,
    ) -> Self {
        let local_id = discovery.local_id();
        let listener = match bind_tcp(port) {
            Ok(l) => match TcpListener::from_std(l) {
                Ok(l) => Some(Arc::new(l)),
                Err(e) => {
                    warn!(error = %e, "tcp listener registration failed");
                    None
                }
            },
            Err(e) => {
                warn!(port, error = %e, "tcp listener bind failed");
                None
            }
        };
        Messaging {
            local_id,
            sock: discovery.socket(),
            tcp_ok: AtomicBool::new(listener.is_some()),
            listener,
            peers: discovery.peer_table(),
            discovery,
            history,
            acks: Mutex::new(HashMap::new()),
            pending_headers: Mutex::new(HashMap::new()),
            next_body_id: Mutex::new(0),
            queue: InboundQueue::new(),
            downloads_dir,
            port,
        }
    }

    /// Whether the TCP listener is up.
    pub fn tcp_ok(&self) -> bool {
        self.tcp_ok.load(Ordering::Relaxed)
    }

    /// Actual TCP port, for ephemeral binds.
    pub fn tcp_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    async fn next_body_id(&self) -> u8 {
        let mut counter = self.next_body_id.lock().await;
        let id = *counter;
        *counter = counter.wrapping_add(1);
        id
    }

    async fn resolve(&self, recipient: UserId) -> Result<SocketAddr, SendError> {
        let peer = self
            .peers
            .get(&recipient)
            .await
            .ok_or(SendError::UnknownPeer(recipient))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(peer.ip, self.port)))
    }

    /// Send a text message: header, ack, body, ack, history entry.
    pub async fn send(&self, recipient: UserId, text: &str) -> Result<(), SendError> {
        self.send_with_timeout(recipient, text, DEFAULT_SEND_TIMEOUT)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        recipient: UserId,
        text: &str,
        wait: Duration,
    ) -> Result<(), SendError> {
        self.send_text_frames(recipient, text, wait).await?;
        self.history
            .append_message(
                &self.local_id.display_name(),
                &recipient.display_name(),
                text,
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    async fn send_text_frames(
        &self,
        recipient: UserId,
        text: &str,
        wait: Duration,
    ) -> Result<(), SendError> {
        let dest = self.resolve(recipient).await?;
        let bid = self.next_body_id().await;
        let body = wire::encode_message_body(bid, text.as_bytes());
        let header = wire::encode_header(&Header {
            from: self.local_id,
            to: recipient,
            op: OpCode::Message,
            body_id: bid,
            body_len: body.len() as u64,
        });
        self.send_and_wait(&header, recipient, dest, bid, wait)
            .await?;
        self.send_and_wait(&body, recipient, dest, bid, wait).await
    }

    /// Unicast fan-out of a text to every known peer; individual
    /// failures are logged and skipped. Recorded once, as global
    /// traffic. Returns how many peers acked.
    pub async fn broadcast_text(&self, text: &str) -> Result<usize, SendError> {
        let peers = self.peers.snapshot().await;
        let mut delivered = 0;
        for id in peers.keys() {
            match self
                .send_text_frames(*id, text, DEFAULT_SEND_TIMEOUT)
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %id, error = %e, "broadcast delivery failed"),
            }
        }
        self.history
            .append_message(
                &self.local_id.display_name(),
                GLOBAL_RECIPIENT,
                text,
                Utc::now(),
            )
            .await?;
        Ok(delivered)
    }

    /// Send a file: UDP header handshake, then the bytes over a fresh
    /// TCP connection identified by the 8-byte big-endian body id.
    pub async fn send_file(
        &self,
        recipient: UserId,
        bytes: &[u8],
        filename: &str,
    ) -> Result<(), SendError> {
        self.send_file_with_timeout(recipient, bytes, filename, DEFAULT_SEND_TIMEOUT)
            .await
    }

    pub async fn send_file_with_timeout(
        &self,
        recipient: UserId,
        bytes: &[u8],
        filename: &str,
        wait: Duration,
    ) -> Result<(), SendError> {
        let dest = self.resolve(recipient).await?;
        let bid = self.next_body_id().await;
        let header = wire::encode_header(&Header {
            from: self.local_id,
            to: recipient,
            op: OpCode::File,
            body_id: bid,
            body_len: bytes.len() as u64,
        });
        self.send_and_wait(&header, recipient, dest, bid, wait)
            .await?;

        // Receiver arms its accept/matching side after acking the header.
        tokio::time::sleep(TCP_ARM_DELAY).await;

        match self.push_file(dest, bid, bytes).await {
            Ok(()) => {
                self.peers.set_tcp_ok(&recipient, true).await;
                self.history
                    .append_file(
                        &self.local_id.display_name(),
                        &recipient.display_name(),
                        filename,
                        bytes.len() as u64,
                        std::path::Path::new(filename),
                        Utc::now(),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.peers.set_tcp_ok(&recipient, false).await;
                Err(SendError::TransferFailed {
                    peer: recipient,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn push_file(&self, dest: SocketAddr, bid: u8, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = timeout(RECV_TIMEOUT, TcpStream::connect(dest))
            .await
            .map_err(|_| timed_out("tcp connect"))??;
        stream.write_all(&u64::from(bid).to_be_bytes()).await?;
        for chunk in bytes.chunks(FILE_CHUNK) {
            stream.write_all(chunk).await?;
        }
        // Half-close signals EOF; the completion response still comes back.
        stream.shutdown().await?;

        let mut resp = [0u8; wire::RESPONSE_LEN];
        timeout(RECV_TIMEOUT, stream.read_exact(&mut resp))
            .await
            .map_err(|_| timed_out("completion response"))??;
        let resp = wire::decode_response(&resp)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if resp.status != Status::Ok {
            return Err(std::io::Error::other(format!(
                "receiver answered {:?}",
                resp.status
            )));
        }
        Ok(())
    }

    /// One frame, up to three attempts, exponential backoff between
    /// them. The waiter is registered fresh per attempt and removed
    /// afterwards; exhaustion triggers a discovery refresh before the
    /// error surfaces.
    async fn send_and_wait(
        &self,
        frame: &[u8],
        peer: UserId,
        dest: SocketAddr,
        body_id: u8,
        wait: Duration,
    ) -> Result<(), SendError> {
        for attempt in 0..SEND_ATTEMPTS {
            let notify = Arc::new(Notify::new());
            self.acks.lock().await.insert(
                peer,
                AckWaiter {
                    body_id,
                    notify: notify.clone(),
                },
            );
            let sent = match self.sock.send_to(frame, dest).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "send failed");
                    false
                }
            };
            let acked = sent && timeout(wait, notify.notified()).await.is_ok();
            self.acks.lock().await.remove(&peer);
            if acked {
                return Ok(());
            }
            if attempt + 1 < SEND_ATTEMPTS {
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt)).await;
            }
        }
        self.discovery.force_discover().await;
        Err(SendError::DeliveryFailed {
            peer,
            attempts: SEND_ATTEMPTS,
        })
    }

    /// Receive loop over the shared UDP socket.
    pub(crate) async fn udp_recv_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; UDP_RECV_BUF];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                r = self.sock.recv_from(&mut buf) => match r {
                    Ok((n, from)) => self.handle_datagram(&buf[..n], from).await,
                    Err(e) => {
                        warn!(error = %e, "udp recv failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("udp receiver stopped");
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        match data.len() {
            wire::RESPONSE_LEN => match wire::decode_response(data) {
                Ok(resp) => self.handle_ack_or_response(&resp, from).await,
                Err(e) => trace!(%from, error = %e, "undecodable response frame"),
            },
            wire::HEADER_LEN => self.handle_header(data, from).await,
            other => trace!(%from, len = other, "dropping frame of unexpected length"),
        }
    }

    /// An `OK` response signals the waiter for its sender, if any;
    /// everything else is discovery traffic.
    pub(crate) async fn handle_ack_or_response(&self, resp: &Response, from: SocketAddr) {
        if resp.status == Status::Ok {
            let acks = self.acks.lock().await;
            if let Some(waiter) = acks.get(&resp.responder) {
                trace!(peer = %resp.responder, bid = waiter.body_id, "ack");
                waiter.notify.notify_one();
                return;
            }
        }
        self.discovery.handle_response(resp, from).await;
    }

    async fn handle_header(&self, data: &[u8], from: SocketAddr) {
        let hdr = match wire::decode_header(data) {
            Ok(hdr) => hdr,
            Err(WireError::UnknownOpCode(op)) => {
                debug!(%from, op, "unknown op code");
                self.respond(Status::BadRequest, from).await;
                return;
            }
            Err(e) => {
                trace!(%from, error = %e, "undecodable header");
                return;
            }
        };
        if hdr.from == self.local_id {
            return; // our own broadcast came back
        }
        let broadcast = hdr.to.is_broadcast();
        if !broadcast && hdr.to != self.local_id {
            debug!(%from, to = %hdr.to, "header not addressed to us");
            self.respond(Status::BadRequest, from).await;
            return;
        }
        match hdr.op {
            OpCode::Echo => self.discovery.handle_echo(&hdr, from).await,
            OpCode::Message => self.recv_message(&hdr, broadcast, from).await,
            OpCode::File => {
                if broadcast {
                    debug!(%from, "rejecting broadcast file header");
                    self.respond(Status::BadRequest, from).await;
                    return;
                }
                self.pending_headers
                    .lock()
                    .await
                    .insert(hdr.body_id, (hdr, Utc::now()));
                self.respond(Status::Ok, from).await;
            }
        }
    }

    /// Message header accepted: ack it, then await the matching body
    /// frame on the shared socket.
    async fn recv_message(&self, hdr: &Header, broadcast: bool, from: SocketAddr) {
        self.respond(Status::Ok, from).await;

        let mut buf = vec![0u8; MSG_BODY_BUF];
        let (n, _) = match timeout(RECV_TIMEOUT, self.sock.recv_from(&mut buf)).await {
            Ok(Ok(got)) => got,
            Ok(Err(e)) => {
                warn!(%from, error = %e, "body receive failed");
                self.respond(Status::InternalError, from).await;
                return;
            }
            Err(_) => {
                debug!(%from, bid = hdr.body_id, "timed out waiting for message body");
                self.respond(Status::InternalError, from).await;
                return;
            }
        };
        let frame = &buf[..n];
        if n as u64 != hdr.body_len {
            debug!(%from, got = n, expected = hdr.body_len, "body length mismatch");
            self.respond(Status::BadRequest, from).await;
            return;
        }
        let payload = match wire::decode_message_body(frame) {
            Ok((bid, payload)) if bid == hdr.body_id => payload,
            _ => {
                debug!(%from, bid = hdr.body_id, "body id mismatch");
                self.respond(Status::BadRequest, from).await;
                return;
            }
        };
        let text = String::from_utf8_lossy(payload).into_owned();
        self.respond(Status::Ok, from).await;
        self.queue
            .push(InboundMessage {
                from: hdr.from,
                broadcast,
                text,
                ts: Utc::now(),
            })
            .await;
    }

    async fn respond(&self, status: Status, to: SocketAddr) {
        let frame = wire::encode_response(status, self.local_id);
        if let Err(e) = self.sock.send_to(&frame, to).await {
            warn!(%to, error = %e, "response send failed");
        }
    }

    /// Accept loop for inbound file connections.
    pub(crate) async fn tcp_accept_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                r = listener.accept() => match r {
                    Ok((stream, addr)) => {
                        let messaging = self.clone();
                        tokio::spawn(async move { messaging.recv_file(stream, addr).await });
                    }
                    Err(e) => warn!(error = %e, "tcp accept failed"),
                }
            }
        }
        debug!("tcp acceptor stopped");
    }

    async fn recv_file(&self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = self.recv_file_inner(&mut stream, addr).await {
            warn!(%addr, error = %e, "file receive failed");
            let frame = wire::encode_response(Status::InternalError, self.local_id);
            let _ = stream.write_all(&frame).await;
        }
    }

    async fn recv_file_inner(
        &self,
        stream: &mut TcpStream,
        addr: SocketAddr,
    ) -> std::io::Result<()> {
        let mut id_buf = [0u8; 8];
        timeout(RECV_TIMEOUT, stream.read_exact(&mut id_buf))
            .await
            .map_err(|_| timed_out("file id"))??;
        let file_id = u64::from_be_bytes(id_buf);

        let bid = u8::try_from(file_id).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file id {} out of body-id range", file_id),
            )
        })?;
        let (hdr, _) = self
            .pending_headers
            .lock()
            .await
            .remove(&bid)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no pending header for body id {}", bid),
                )
            })?;

        let body_len = usize::try_from(hdr.body_len)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "file too large"))?;
        if body_len == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty file body",
            ));
        }

        let mut body = Vec::new();
        let mut chunk = vec![0u8; FILE_CHUNK];
        let mut next_progress = PROGRESS_STEP;
        while body.len() < body_len {
            let want = FILE_CHUNK.min(body_len - body.len());
            let n = timeout(RECV_TIMEOUT, stream.read(&mut chunk[..want]))
                .await
                .map_err(|_| timed_out("file body"))??;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed at {}/{} bytes", body.len(), body_len),
                ));
            }
            body.extend_from_slice(&chunk[..n]);
            if body.len() >= next_progress {
                debug!(from = %hdr.from, received = body.len(), total = body_len, "file transfer progress");
                next_progress += PROGRESS_STEP;
            }
        }

        let ext = detect_extension(&body);
        let name = sanitize_filename(&format!(
            "recv_{}_{}{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            bid,
            ext
        ));
        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        let path = self.downloads_dir.join(&name);
        tokio::fs::write(&path, &body).await?;
        debug!(from = %hdr.from, %addr, file = %name, size = body.len(), "file received");

        self.history
            .append_file(
                &hdr.from.display_name(),
                &self.local_id.display_name(),
                &name,
                body.len() as u64,
                &path,
                Utc::now(),
            )
            .await
            .map_err(std::io::Error::other)?;

        let frame = wire::encode_response(Status::Ok, self.local_id);
        stream.write_all(&frame).await?;
        Ok(())
    }

    /// Consumer worker: drains the inbound queue into history. Failures
    /// are logged per item; the worker never dies.
    pub(crate) async fn consumer_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let msg = tokio::select! {
                _ = shutdown.changed() => break,
                msg = self.queue.pop() => msg,
            };
            let to = if msg.broadcast {
                GLOBAL_RECIPIENT.to_string()
            } else {
                self.local_id.display_name()
            };
            if let Err(e) = self
                .history
                .append_message(&msg.from.display_name(), &to, &msg.text, msg.ts)
                .await
            {
                warn!(from = %msg.from, error = %e, "failed to record inbound message");
            }
        }
        debug!("message consumer stopped");
    }

    /// Sweeper worker: drops pending headers past their TTL.
    pub(crate) async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.sweep_once().await,
            }
        }
        debug!("pending-header sweeper stopped");
    }

    async fn sweep_once(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(PENDING_TTL_SECS);
        let mut pending = self.pending_headers.lock().await;
        let before = pending.len();
        pending.retain(|_, (_, seen)| *seen > cutoff);
        let removed = before - pending.len();
        if removed > 0 {
            debug!(removed, "swept stale pending file headers");
        }
    }
}

fn bind_tcp(port: u16) -> std::io::Result<std::net::TcpListener> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    let _ = sock.set_recv_buffer_size(SOCKET_BUF_BYTES);
    let _ = sock.set_send_buffer_size(SOCKET_BUF_BYTES);
    sock.set_nonblocking(true)?;
    sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    sock.listen(5)?;
    Ok(sock.into())
}

fn timed_out(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{} timed out", what))
}

/// Strip path separators and control characters, forbid traversal,
/// clamp the stem, keep a plausible extension.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (base, None),
    };
    let mut clean: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' '))
        .collect();
    clean.truncate(MAX_NAME_LEN);
    if clean.trim().is_empty() {
        clean = "file".to_string();
    }
    match ext {
        Some(ext) => {
            let mut ext: String = ext
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(10)
                .collect();
            ext.make_ascii_lowercase();
            if ext.is_empty() {
                clean
            } else {
                format!("{}.{}", clean, ext)
            }
        }
        None => clean,
    }
}

/// Guess an extension from magic numbers, falling back to a text probe.
fn detect_extension(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF", ".pdf"),
        (b"\x89PNG\r\n\x1a\n", ".png"),
        (b"\xff\xd8\xff", ".jpg"),
        (b"GIF87a", ".gif"),
        (b"GIF89a", ".gif"),
        (b"\x1f\x8b\x08", ".gz"),
        (b"PK\x03\x04", ".zip"),
        (b"Rar!", ".rar"),
    ];
    for (sig, ext) in SIGNATURES {
        if data.starts_with(sig) {
            return ext;
        }
    }
    let probe = &data[..data.len().min(1024)];
    if std::str::from_utf8(probe).is_ok() && !probe.contains(&0) {
        return ".txt";
    }
    ".bin"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HistoryEntry, MemoryHistoryStore, MemoryPeerStore};

    fn foreign_addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 77, 5), 9990))
    }

    async fn endpoint(id: &str, downloads: PathBuf) -> (Arc<Messaging>, Arc<MemoryHistoryStore>) {
        endpoint_on_port(id, downloads, 0).await
    }

    // A non-zero port is needed whenever a test actually exercises
    // send_and_wait: the destination address is built from this same
    // port (all peers share one port in the real protocol), and the
    // kernel rejects sendto() to port 0.
    async fn endpoint_on_port(
        id: &str,
        downloads: PathBuf,
        port: u16,
    ) -> (Arc<Messaging>, Arc<MemoryHistoryStore>) {
        let discovery = Arc::new(
            Discovery::bind(
                UserId::from(id),
                Duration::from_secs(1),
                0,
                Arc::new(MemoryPeerStore::default()),
            )
            .unwrap(),
        );
        let history = Arc::new(MemoryHistoryStore::default());
        let messaging = Arc::new(Messaging::bind(
            discovery,
            history.clone(),
            downloads,
            port,
        ));
        (messaging, history)
    }

    async fn register_peer(m: &Messaging, id: &str, ip: [u8; 4]) {
        m.peers
            .upsert(UserId::from(id), ip.into(), Utc::now())
            .await;
    }

    #[tokio::test]
    async fn body_ids_roll_over() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        *m.next_body_id.lock().await = 255;
        assert_eq!(m.next_body_id().await, 255);
        assert_eq!(m.next_body_id().await, 0);
        assert_eq!(m.next_body_id().await, 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_rejected() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        let err = m.send(UserId::from("ghost"), "hi").await.unwrap_err();
        assert!(matches!(err, SendError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn delivery_fails_after_retries_without_acks() {
        let (m, history) = endpoint("alice", PathBuf::from(".")).await;
        register_peer(&m, "bob", [192, 168, 77, 5]).await;
        let err = m
            .send_with_timeout(UserId::from("bob"), "hi", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SendError::DeliveryFailed { attempts: 3, .. }
        ));
        // No history entry for a failed send.
        let convo = history.get_conversation("alice", "bob").await.unwrap();
        assert!(convo.is_empty());
    }

    #[tokio::test]
    async fn send_succeeds_when_acks_arrive() {
        let (m, history) = endpoint_on_port("alice", PathBuf::from("."), 19990).await;
        register_peer(&m, "bob", [192, 168, 77, 5]).await;

        let acker = m.clone();
        let ack_task = tokio::spawn(async move {
            // Ack whatever send is outstanding, twice (header then body).
            for _ in 0..2 {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let acks = acker.acks.lock().await;
                    if let Some(waiter) = acks.get(&UserId::from("bob")) {
                        waiter.notify.notify_one();
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        });

        m.send_with_timeout(UserId::from("bob"), "hola", Duration::from_secs(2))
            .await
            .unwrap();
        ack_task.await.unwrap();

        let convo = history.get_conversation("alice", "bob").await.unwrap();
        assert_eq!(convo.len(), 1);
        match &convo[0] {
            HistoryEntry::Message { from, to, text, .. } => {
                assert_eq!(from, "alice");
                assert_eq!(to, "bob");
                assert_eq!(text, "hola");
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_acks_are_no_ops() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        let notify = Arc::new(Notify::new());
        m.acks.lock().await.insert(
            UserId::from("bob"),
            AckWaiter {
                body_id: 3,
                notify: notify.clone(),
            },
        );
        let resp = Response {
            status: Status::Ok,
            responder: UserId::from("bob"),
        };
        m.handle_ack_or_response(&resp, foreign_addr()).await;
        m.handle_ack_or_response(&resp, foreign_addr()).await;
        // The waiter got its signal; nothing panicked or deadlocked.
        timeout(Duration::from_millis(100), notify.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unmatched_response_reaches_discovery() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        let resp = Response {
            status: Status::Ok,
            responder: UserId::from("bob"),
        };
        m.handle_ack_or_response(&resp, foreign_addr()).await;
        let peers = m.discovery.get_peers().await;
        assert!(peers.contains_key(&UserId::from("bob")));
    }

    #[tokio::test]
    async fn broadcast_file_header_is_rejected_without_pending_entry() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        let hdr = Header {
            from: UserId::from("bob"),
            to: UserId::BROADCAST,
            op: OpCode::File,
            body_id: 9,
            body_len: 100,
        };
        m.handle_header(&wire::encode_header(&hdr), foreign_addr())
            .await;
        assert!(m.pending_headers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unicast_file_header_is_recorded() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        let hdr = Header {
            from: UserId::from("bob"),
            to: UserId::from("alice"),
            op: OpCode::File,
            body_id: 9,
            body_len: 100,
        };
        m.handle_header(&wire::encode_header(&hdr), foreign_addr())
            .await;
        let pending = m.pending_headers.lock().await;
        assert!(pending.contains_key(&9));
    }

    #[tokio::test]
    async fn misaddressed_header_is_ignored_for_state() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        let hdr = Header {
            from: UserId::from("bob"),
            to: UserId::from("carol"),
            op: OpCode::File,
            body_id: 9,
            body_len: 100,
        };
        m.handle_header(&wire::encode_header(&hdr), foreign_addr())
            .await;
        assert!(m.pending_headers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn own_broadcast_is_ignored() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        let hdr = Header {
            from: UserId::from("alice"),
            to: UserId::BROADCAST,
            op: OpCode::Echo,
            body_id: 0,
            body_len: 0,
        };
        m.handle_header(&wire::encode_header(&hdr), foreign_addr())
            .await;
        assert!(m.discovery.get_peers().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_drops_only_stale_headers() {
        let (m, _) = endpoint("alice", PathBuf::from(".")).await;
        let hdr = Header {
            from: UserId::from("bob"),
            to: UserId::from("alice"),
            op: OpCode::File,
            body_id: 1,
            body_len: 10,
        };
        {
            let mut pending = m.pending_headers.lock().await;
            pending.insert(1, (hdr, Utc::now() - chrono::Duration::seconds(31)));
            pending.insert(2, (hdr, Utc::now()));
        }
        m.sweep_once().await;
        let pending = m.pending_headers.lock().await;
        assert!(!pending.contains_key(&1));
        assert!(pending.contains_key(&2));
    }

    #[tokio::test]
    async fn inbound_queue_drops_oldest_on_overflow() {
        let q = InboundQueue::new();
        for i in 0..QUEUE_CAP + 1 {
            q.push(InboundMessage {
                from: UserId::from("bob"),
                broadcast: false,
                text: i.to_string(),
                ts: Utc::now(),
            })
            .await;
        }
        assert_eq!(q.inner.lock().await.len(), QUEUE_CAP);
        assert_eq!(q.pop().await.text, "1");
    }

    #[tokio::test]
    async fn consumer_records_global_recipient_for_broadcast() {
        let (m, history) = endpoint("alice", PathBuf::from(".")).await;
        let (tx, rx) = watch::channel(false);
        let consumer = tokio::spawn(m.clone().consumer_loop(rx));
        m.queue
            .push(InboundMessage {
                from: UserId::from("bob"),
                broadcast: true,
                text: "hi all".into(),
                ts: Utc::now(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        consumer.await.unwrap();

        let convo = history
            .get_conversation("bob", GLOBAL_RECIPIENT)
            .await
            .unwrap();
        assert_eq!(convo.len(), 1);
        assert_eq!(convo[0].to(), GLOBAL_RECIPIENT);
    }

    #[tokio::test]
    async fn file_lands_in_downloads_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let (m, history) = endpoint("alice", dir.path().to_path_buf()).await;
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        m.pending_headers.lock().await.insert(
            7,
            (
                Header {
                    from: UserId::from("bob"),
                    to: UserId::from("alice"),
                    op: OpCode::File,
                    body_id: 7,
                    body_len: payload.len() as u64,
                },
                Utc::now(),
            ),
        );
        let (tx, rx) = watch::channel(false);
        let acceptor = tokio::spawn(m.clone().tcp_accept_loop(rx));

        let port = m.tcp_port().unwrap();
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        stream.write_all(&7u64.to_be_bytes()).await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut resp = [0u8; wire::RESPONSE_LEN];
        stream.read_exact(&mut resp).await.unwrap();
        let resp = wire::decode_response(&resp).unwrap();
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.responder, UserId::from("alice"));

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(std::fs::read(&entries[0]).unwrap(), payload);

        let convo = history.get_conversation("bob", "alice").await.unwrap();
        assert!(matches!(&convo[0], HistoryEntry::File { size, .. } if *size == payload.len() as u64));

        tx.send(true).unwrap();
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_file_id_gets_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _) = endpoint("alice", dir.path().to_path_buf()).await;
        let (tx, rx) = watch::channel(false);
        let acceptor = tokio::spawn(m.clone().tcp_accept_loop(rx));

        let port = m.tcp_port().unwrap();
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        stream.write_all(&42u64.to_be_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut resp = [0u8; wire::RESPONSE_LEN];
        stream.read_exact(&mut resp).await.unwrap();
        assert_eq!(
            wire::decode_response(&resp).unwrap().status,
            Status::InternalError
        );

        tx.send(true).unwrap();
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn short_file_body_gets_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _) = endpoint("alice", dir.path().to_path_buf()).await;
        m.pending_headers.lock().await.insert(
            3,
            (
                Header {
                    from: UserId::from("bob"),
                    to: UserId::from("alice"),
                    op: OpCode::File,
                    body_id: 3,
                    body_len: 1000,
                },
                Utc::now(),
            ),
        );
        let (tx, rx) = watch::channel(false);
        let acceptor = tokio::spawn(m.clone().tcp_accept_loop(rx));

        let port = m.tcp_port().unwrap();
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        stream.write_all(&3u64.to_be_bytes()).await.unwrap();
        stream.write_all(&[0u8; 100]).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut resp = [0u8; wire::RESPONSE_LEN];
        stream.read_exact(&mut resp).await.unwrap();
        assert_eq!(
            wire::decode_response(&resp).unwrap().status,
            Status::InternalError
        );

        tx.send(true).unwrap();
        acceptor.await.unwrap();
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("a/b\\c.txt"), "c.txt");
        assert_eq!(sanitize_filename("..."), "file");
        assert_eq!(sanitize_filename("shout.TXT"), "shout.txt");
        let long = format!("{}.bin", "x".repeat(200));
        let cleaned = sanitize_filename(&long);
        assert!(cleaned.len() <= MAX_NAME_LEN + 4);
        assert!(cleaned.ends_with(".bin"));
    }

    #[test]
    fn extensions_are_sniffed() {
        assert_eq!(detect_extension(b"%PDF-1.7 ..."), ".pdf");
        assert_eq!(detect_extension(b"\x89PNG\r\n\x1a\nrest"), ".png");
        assert_eq!(detect_extension(b"plain words"), ".txt");
        assert_eq!(detect_extension(&[0u8, 1, 2, 3]), ".bin");
    }
}
