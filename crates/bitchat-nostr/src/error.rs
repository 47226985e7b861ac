//! Error types for the relay transport

use bitchat_core::errors::TransportError;
use bitchat_core::BitchatError;

/// Failures specific to the Nostr transport
#[derive(Debug, thiserror::Error)]
pub enum NostrTransportError {
    #[error("no relay key known for peer {peer_id}")]
    NoRelayKey { peer_id: String },

    #[error("invalid relay public key: {0}")]
    InvalidKey(String),

    #[error("client error: {0}")]
    Client(#[from] nostr_sdk::client::Error),

    #[error("gift wrap failed: {0}")]
    WrapFailed(String),

    #[error("not a BitChat relay message")]
    ForeignMessage,

    #[error("envelope decode failed: {0}")]
    EnvelopeDecode(String),
}

impl From<NostrTransportError> for BitchatError {
    fn from(err: NostrTransportError) -> Self {
        match err {
            NostrTransportError::NoRelayKey { peer_id } => {
                BitchatError::Transport(TransportError::Unreachable { peer_id })
            }
            other => BitchatError::Transport(TransportError::Link(other.to_string())),
        }
    }
}
