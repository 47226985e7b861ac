//! Error types for the BLE link

use bitchat_core::errors::TransportError;
use bitchat_core::BitchatError;

/// Failures specific to the BLE link
#[derive(Debug, thiserror::Error)]
pub enum BleLinkError {
    #[error("no BLE adapter available")]
    NoAdapter,

    #[error("BLE operation failed: {0}")]
    Btleplug(#[from] btleplug::Error),

    #[error("connection to {address} timed out")]
    ConnectionTimeout { address: String },

    #[error("characteristic {uuid} not found on peer")]
    CharacteristicMissing { uuid: uuid::Uuid },

    #[error("write queue for connection {link} is full")]
    WriteQueueFull { link: u64 },

    #[error("advertising unsupported on this platform")]
    AdvertisingUnsupported,

    #[error("link is not running")]
    NotRunning,
}

impl From<BleLinkError> for BitchatError {
    fn from(err: BleLinkError) -> Self {
        BitchatError::Transport(TransportError::Link(err.to_string()))
    }
}
