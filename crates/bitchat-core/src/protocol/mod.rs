//! BitChat wire protocol
//!
//! - [`wire`]: the binary packet format and codec
//! - [`fragmentation`]: splitting and reassembling frames over MTU
//! - [`payloads`]: typed payload codecs for the individual message kinds

pub mod fragmentation;
pub mod payloads;
pub mod wire;

pub use fragmentation::{Fragment, FragmentHeader, Fragmenter, Reassembler};
pub use payloads::{
    AnnouncePayload, DeliveryAckPayload, FavoritePayload, FileTransferPayload,
    PrivateMessagePayload, PublicMessagePayload, ReadReceiptPayload,
};
pub use wire::{frame_length, BitchatPacket, MessageType, PROTOCOL_VERSION};
