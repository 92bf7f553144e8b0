//! Local Chat Protocol (LCP) engine.
//!
//! A serverless LAN node: discovery keeps a live peer table via UDP
//! broadcast probes, messaging moves acked text frames over the same
//! socket and bulk file bodies over TCP, both on port 9990. Wire
//! framing is specified in the `wire` module.
//!
//! ## Host responsibilities
//!
//! - **Persistence**: the engine consumes [`PeerStore`] and
//!   [`HistoryStore`]; the host decides the backing format (volatile
//!   [`MemoryPeerStore`]/[`MemoryHistoryStore`] implementations ship
//!   for embedding and tests).
//! - **Presentation**: the engine exposes query/command methods the UI
//!   polls; it renders nothing and prompts for nothing.

pub mod discovery;
pub mod engine;
pub mod identity;
pub mod messaging;
pub mod peers;
pub mod store;
pub mod wire;

pub use discovery::Discovery;
pub use engine::{Engine, EngineConfig, EngineError};
pub use identity::{UserId, USER_ID_LEN};
pub use messaging::{Messaging, SendError, DEFAULT_SEND_TIMEOUT};
pub use peers::{Peer, PeerTable, OFFLINE_THRESHOLD_SECS};
pub use store::{
    HistoryEntry, HistoryStore, MemoryHistoryStore, MemoryPeerStore, PeerStatus, PeerStore,
    PersistedPeer, StoreError, GLOBAL_RECIPIENT,
};
pub use wire::{
    decode_header, decode_message_body, decode_response, encode_header, encode_message_body,
    encode_response, Header, OpCode, Response, Status, WireError, HEADER_LEN, LCP_PORT,
    RESPONSE_LEN,
};
