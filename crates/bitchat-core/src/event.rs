//! Application event bus
//!
//! The engine reports everything the host cares about through one typed
//! channel. Components hold an [`EventEmitter`]; the host owns the matching
//! receiver. Emission never blocks the mesh loop: if the host falls behind
//! the event is dropped and logged.

use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{Fingerprint, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// App Events
// ----------------------------------------------------------------------------

/// State changes surfaced to the host application
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A mesh link to a peer came up
    PeerConnected { peer_id: PeerId, nickname: Option<String> },
    /// A mesh link to a peer went down
    PeerDisconnected { peer_id: PeerId },
    /// A public broadcast message arrived (post-pipeline)
    PublicMessageReceived {
        peer_id: PeerId,
        message_id: String,
        content: String,
        timestamp: Timestamp,
    },
    /// A private message arrived and decrypted
    PrivateMessageReceived {
        peer_id: PeerId,
        message_id: String,
        content: String,
        timestamp: Timestamp,
    },
    /// The recipient acknowledged delivery of a message
    DeliveryAckReceived { peer_id: PeerId, message_id: String },
    /// The recipient read a message
    ReadReceiptReceived { peer_id: PeerId, message_id: String },
    /// A Noise session reached transport state
    SessionEstablished { peer_id: PeerId, fingerprint: Fingerprint },
    /// A Noise session died (auth failure, leave, or timeout)
    SessionLost { peer_id: PeerId },
    /// A queued private message expired without a reachable transport
    MessageUnreachable { peer_id: PeerId, message_id: String },
    /// A handshake did not complete within its deadline
    HandshakeTimedOut { peer_id: PeerId },
    /// An inbound file transfer is waiting for user acceptance
    PendingFileAdded { id: String, peer_id: PeerId, file_size: usize },
    /// A pending file was accepted, declined, evicted, or expired
    PendingFileRemoved { id: String },
    /// A peer toggled the favorite flag for us, or our mapping changed
    FavoriteStatusChanged { peer_id: PeerId, is_favorite: bool },
}

// ----------------------------------------------------------------------------
// Event Emitter
// ----------------------------------------------------------------------------

/// Cloneable sending half of the application event bus
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<AppEvent>,
}

impl EventEmitter {
    /// Emit an event without blocking; drops (and logs) when the host lags
    pub fn emit(&self, event: AppEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("app event dropped: {}", e);
        }
    }
}

/// Create the event bus with the given buffer depth
pub fn event_channel(buffer: usize) -> (EventEmitter, mpsc::Receiver<AppEvent>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventEmitter { tx }, rx)
}

/// An emitter whose events go nowhere, for tests and embedding
pub fn null_emitter() -> EventEmitter {
    let (tx, _rx) = mpsc::channel(1);
    EventEmitter { tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (emitter, mut rx) = event_channel(8);
        emitter.emit(AppEvent::PeerDisconnected {
            peer_id: PeerId::new([1; 8]),
        });
        match rx.recv().await {
            Some(AppEvent::PeerDisconnected { peer_id }) => {
                assert_eq!(peer_id, PeerId::new([1; 8]));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_never_blocks_when_full() {
        let (emitter, _rx) = event_channel(1);
        for _ in 0..16 {
            emitter.emit(AppEvent::PeerDisconnected {
                peer_id: PeerId::new([2; 8]),
            });
        }
    }
}
