//! BitChat core protocol engine
//!
//! The headless heart of BitChat: a decentralized peer-to-peer chat system
//! over a BLE mesh with an opportunistic relay fallback. This crate has no
//! knowledge of any radio or UI; it owns the wire format, fragmentation,
//! Noise sessions, flood routing, the message pipeline, and the pending
//! file hold, all reachable through narrow traits so the engine runs the
//! same against btleplug, a relay socket, or an in-memory test fabric.
//!
//! ## Architecture
//!
//! - [`protocol`]: the binary packet format, fragmentation, and payload codecs
//! - [`noise`]: XX handshake, transport ciphers, replay protection, XChaCha
//! - [`mesh`]: the single-owner mesh loop composing all of the above over a
//!   [`link::MeshLink`]
//! - [`router`]: per-recipient transport selection with a per-peer outbox
//! - [`pipeline`]: batched ordering and content dedup for the public timeline
//! - [`files`]: bounded in-memory hold of inbound file transfers
//! - [`identity`]: long-term keys, favorites, and the block list
//!
//! Transport crates (`bitchat-ble`, `bitchat-nostr`) implement
//! [`link::MeshLink`] and [`transport::Transport`] respectively and plug in
//! from the outside; the runtime wiring order is link → mesh → router.

pub mod config;
pub mod errors;
pub mod event;
pub mod files;
pub mod identity;
pub mod link;
pub mod mesh;
pub mod noise;
pub mod pipeline;
pub mod protocol;
pub mod router;
pub mod testing;
pub mod transport;
pub mod types;

pub use errors::{BitchatError, BitchatResult, Result};
pub use event::{event_channel, AppEvent, EventEmitter};
pub use mesh::MeshTransport;
pub use protocol::{BitchatPacket, MessageType};
pub use router::MessageRouter;
pub use transport::{Transport, TransportKind};
pub use types::{Fingerprint, PeerId, SystemTimeSource, TimeSource, Timestamp, Ttl};
