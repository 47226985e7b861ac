//! Transport abstraction above the mesh
//!
//! The message router selects between transports (mesh first, relay
//! fallback) per recipient. Each transport answers reachability and moves
//! the handful of private-message shapes; broadcast stays mesh-only.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::PeerId;

/// Transport identifier for routing decisions and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// BLE mesh
    Mesh,
    /// Relay (Nostr) fallback
    Relay,
    /// In-memory transport for tests
    Local,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Mesh => write!(f, "mesh"),
            TransportKind::Relay => write!(f, "relay"),
            TransportKind::Local => write!(f, "local"),
        }
    }
}

/// A way to move addressed messages to a peer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is
    fn kind(&self) -> TransportKind;

    /// Whether `peer` can currently be reached on this transport
    fn is_peer_reachable(&self, peer: PeerId) -> bool;

    /// Send a private chat message
    async fn send_private_message(
        &self,
        content: &str,
        to: PeerId,
        recipient_nickname: &str,
        message_id: &str,
    ) -> Result<()>;

    /// Send a read receipt (best effort, never queued)
    async fn send_read_receipt(&self, to: PeerId, message_id: &str) -> Result<()>;

    /// Send a delivery acknowledgment (best effort, never queued)
    async fn send_delivery_ack(&self, to: PeerId, message_id: &str) -> Result<()>;

    /// Notify a peer of a favorite toggle
    async fn send_favorite_notification(&self, to: PeerId, is_favorite: bool) -> Result<()>;
}
