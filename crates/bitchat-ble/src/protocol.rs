//! BLE protocol constants and stream framing
//!
//! The BitChat GATT service exposes two characteristics: peers write frames
//! to our `TX` characteristic (write-without-response) and subscribe to our
//! `RX` characteristic for notifies. A logical frame can span several ATT
//! packets, so each connection runs a [`FrameAssembler`] that buffers bytes
//! until [`bitchat_core::protocol::frame_length`] can delimit a frame.

use bitchat_core::protocol::frame_length;
use bitchat_core::PeerId;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// UUIDs
// ----------------------------------------------------------------------------

/// BitChat BLE service UUID
pub const BITCHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Peers write inbound frames here (write without response)
pub const BITCHAT_TX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// We notify outbound frames here
pub const BITCHAT_RX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Advertised device name for a peer
pub fn device_name(peer_id: &PeerId, prefix: &str) -> String {
    format!("{}-{}", prefix, peer_id)
}

// ----------------------------------------------------------------------------
// Frame Assembly
// ----------------------------------------------------------------------------

/// Upper bound on buffered bytes per connection; a peer that streams
/// garbage past this is cut off
const MAX_BUFFERED: usize = 64 * 1024;

/// Accumulates notify chunks into complete wire frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one notify chunk; returns every frame completed by it.
    ///
    /// Returns `Err(())` when the peer overflowed the assembly buffer
    /// without producing a delimitable frame.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, ()> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            match frame_length(&self.buffer) {
                Some(len) if self.buffer.len() >= len => {
                    let rest = self.buffer.split_off(len);
                    frames.push(std::mem::replace(&mut self.buffer, rest));
                }
                _ => break,
            }
        }

        if self.buffer.len() > MAX_BUFFERED {
            self.buffer.clear();
            return Err(());
        }
        Ok(frames)
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitchat_core::protocol::wire::MessageType;
    use bitchat_core::types::{Timestamp, Ttl};
    use bitchat_core::BitchatPacket;

    fn frame(payload_len: usize) -> Vec<u8> {
        BitchatPacket::new(
            MessageType::Message,
            PeerId::new([1; 8]),
            Timestamp::new(42),
            vec![0xAA; payload_len],
        )
        .with_ttl(Ttl::new(3))
        .encode(true)
        .unwrap()
    }

    #[test]
    fn test_whole_frame_in_one_chunk() {
        let mut assembler = FrameAssembler::new();
        let frame = frame(50);
        let out = assembler.push(&frame).unwrap();
        assert_eq!(out, vec![frame]);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut assembler = FrameAssembler::new();
        let frame = frame(700);
        let mid = frame.len() / 2;

        assert!(assembler.push(&frame[..10]).unwrap().is_empty());
        assert!(assembler.push(&frame[10..mid]).unwrap().is_empty());
        let out = assembler.push(&frame[mid..]).unwrap();
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut assembler = FrameAssembler::new();
        let first = frame(10);
        let second = frame(300);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        // second frame's tail arrives later
        let cut = first.len() + second.len() / 2;

        let out = assembler.push(&stream[..cut]).unwrap();
        assert_eq!(out, vec![first]);
        let out = assembler.push(&stream[cut..]).unwrap();
        assert_eq!(out, vec![second]);
    }

    #[test]
    fn test_overflow_resets() {
        let mut assembler = FrameAssembler::new();
        // all-0xFF parses as a 64 KiB frame declaration that never completes
        let garbage = vec![0xFFu8; MAX_BUFFERED + 64];
        assert!(assembler.push(&garbage).is_err());
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_device_name() {
        let peer = PeerId::new([0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56, 0x78, 0x9A]);
        assert_eq!(
            device_name(&peer, "BitChat"),
            "BitChat-abcdef123456789a"
        );
    }
}
