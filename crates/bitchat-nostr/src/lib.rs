//! Relay fallback transport for BitChat
//!
//! When a peer is out of radio range but has shared its Nostr public key,
//! private traffic falls back to public relays: the payload rides as a
//! sealed gift-wrapped DM (NIP-17 style) addressed to the recipient's
//! long-term key, and inbound wraps addressed to us surface through the
//! same application events as mesh receptions.
//!
//! Reachability is exactly "the favorites registry knows a relay key for
//! this peer"; the message router above decides when to fall back here.

pub mod config;
pub mod envelope;
pub mod error;
pub mod transport;

pub use config::NostrConfig;
pub use envelope::{RelayEnvelope, RelayMessageKind};
pub use error::NostrTransportError;
pub use transport::NostrTransport;
