//! Binary packet format and codec
//!
//! Wire layout (all multi-byte integers big-endian):
//!
//! ```text
//! version(1) | type(1) | ttl(1) | timestamp(8) | sender(8)
//! | has_recipient(1) | recipient(8 if present)
//! | payload_len(2) | payload
//! | has_signature(1) | signature(64 if present)
//! | padding (optional, random, 2-byte trailer holds unpadded length)
//! ```
//!
//! Padding rounds the encoded frame up to the next bucket in
//! `{256, 512, 1024, 2048, 4096}` to hide message sizes; frames too large
//! for the biggest bucket go out unpadded. Decoding parses the
//! self-delimiting fields and ignores whatever padding trails them.

use rand::RngCore;

use crate::errors::{PacketError, Result};
use crate::identity::IdentityKeyPair;
use crate::types::{PeerId, Timestamp, Ttl};

// ----------------------------------------------------------------------------
// Protocol Constants
// ----------------------------------------------------------------------------

/// Current protocol version; receivers reject anything else
pub const PROTOCOL_VERSION: u8 = 2;

/// Fixed part of the header: version, type, ttl, timestamp, sender, recipient flag
const FIXED_HEADER_LEN: usize = 1 + 1 + 1 + 8 + 8 + 1;

/// Padding buckets for size hiding
const PADDING_BUCKETS: [usize; 5] = [256, 512, 1024, 2048, 4096];

/// Trailer recording the unpadded length inside a padded frame
const PAD_TRAILER_LEN: usize = 2;

/// Maximum payload carried by one packet
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Message kinds on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Periodic presence beacon with nickname and static key
    Announce = 0x01,
    /// Public chat message, unsigned broadcast
    Message = 0x02,
    /// Graceful departure
    Leave = 0x03,
    /// Private chat message (rides inside NoiseTransport once a session is up)
    PrivateMessage = 0x04,
    /// File transfer payload
    FileTransfer = 0x05,
    /// Delivery acknowledgment for a private message
    DeliveryAck = 0x06,
    /// Read receipt for a private message
    ReadReceipt = 0x07,
    /// Favorite / unfavorite notification
    Favorite = 0x08,
    /// Shard of a larger packet
    Fragment = 0x20,
    /// Noise XX message 1 (initiator ephemeral)
    NoiseHandshakeInit = 0x30,
    /// Noise XX messages 2 and 3
    NoiseHandshakeResp = 0x31,
    /// Encrypted transport message, `nonce(8 LE) || ciphertext`
    NoiseTransport = 0x32,
}

impl MessageType {
    /// Parse from the raw wire byte
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::Announce),
            0x02 => Ok(MessageType::Message),
            0x03 => Ok(MessageType::Leave),
            0x04 => Ok(MessageType::PrivateMessage),
            0x05 => Ok(MessageType::FileTransfer),
            0x06 => Ok(MessageType::DeliveryAck),
            0x07 => Ok(MessageType::ReadReceipt),
            0x08 => Ok(MessageType::Favorite),
            0x20 => Ok(MessageType::Fragment),
            0x30 => Ok(MessageType::NoiseHandshakeInit),
            0x31 => Ok(MessageType::NoiseHandshakeResp),
            0x32 => Ok(MessageType::NoiseTransport),
            other => Err(PacketError::UnsupportedType(other).into()),
        }
    }

    /// Raw wire byte
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ----------------------------------------------------------------------------
// Packet
// ----------------------------------------------------------------------------

/// The mesh wire unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitchatPacket {
    pub version: u8,
    pub message_type: MessageType,
    pub ttl: Ttl,
    pub timestamp: Timestamp,
    pub sender_id: PeerId,
    /// None for broadcast
    pub recipient_id: Option<PeerId>,
    pub payload: Vec<u8>,
    /// Ed25519 over the canonical digest, when present
    pub signature: Option<[u8; 64]>,
}

impl BitchatPacket {
    /// Create a broadcast packet with default TTL
    pub fn new(
        message_type: MessageType,
        sender_id: PeerId,
        timestamp: Timestamp,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            ttl: Ttl::DEFAULT,
            timestamp,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Address the packet to a single recipient
    pub fn with_recipient(mut self, recipient_id: PeerId) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    /// Override the TTL
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Broadcast = no recipient, or the all-0xFF address
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(id) => id.is_broadcast(),
        }
    }

    /// Whether the packet is addressed to `peer`
    pub fn is_for(&self, peer: PeerId) -> bool {
        self.recipient_id == Some(peer)
    }

    /// Sign with the identity key; excludes TTL so relays can decrement it
    pub fn sign(&mut self, identity: &IdentityKeyPair) {
        let digest = self.canonical_digest();
        self.signature = Some(identity.sign(digest));
    }

    /// Verify the signature against the claimed identity public key
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> Result<()> {
        let signature = self
            .signature
            .ok_or_else(|| PacketError::Malformed("no signature present".into()))?;
        let digest = self.canonical_digest();
        IdentityKeyPair::verify(public_key, digest, &signature)
    }

    /// Canonical digest over header and payload, excluding TTL and signature
    fn canonical_digest(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"bitchat-packet-v2");
        hasher.update([self.version, self.message_type.as_u8()]);
        hasher.update(self.timestamp.as_millis().to_be_bytes());
        hasher.update(self.sender_id.as_bytes());
        if let Some(recipient) = &self.recipient_id {
            hasher.update(recipient.as_bytes());
        }
        hasher.update(&self.payload);
        hasher.finalize().into()
    }

    // ------------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------------

    /// Encode to wire bytes, optionally padding to the next size bucket
    pub fn encode(&self, pad: bool) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::Malformed(format!(
                "payload of {} bytes exceeds the wire limit",
                self.payload.len()
            ))
            .into());
        }

        let mut bytes = Vec::with_capacity(self.structural_len());
        bytes.push(self.version);
        bytes.push(self.message_type.as_u8());
        bytes.push(self.ttl.value());
        bytes.extend_from_slice(&self.timestamp.as_millis().to_be_bytes());
        bytes.extend_from_slice(self.sender_id.as_bytes());

        match &self.recipient_id {
            Some(recipient) => {
                bytes.push(1);
                bytes.extend_from_slice(recipient.as_bytes());
            }
            None => bytes.push(0),
        }

        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);

        match &self.signature {
            Some(signature) => {
                bytes.push(1);
                bytes.extend_from_slice(signature);
            }
            None => bytes.push(0),
        }

        if pad {
            pad_to_bucket(&mut bytes);
        }
        Ok(bytes)
    }

    /// Decode from wire bytes; trailing padding is ignored
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(PacketError::TruncatedHeader {
                expected: FIXED_HEADER_LEN,
                actual: bytes.len(),
            }
            .into());
        }

        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnknownVersion(version).into());
        }
        let message_type = MessageType::from_u8(bytes[1])?;
        let ttl = Ttl::new(bytes[2]);
        let timestamp = Timestamp::new(u64::from_be_bytes(
            bytes[3..11].try_into().expect("slice length checked"),
        ));
        let sender_id = PeerId::from_bytes(&bytes[11..19]);

        let mut offset = FIXED_HEADER_LEN;
        let recipient_id = match bytes[19] {
            0 => None,
            _ => {
                if bytes.len() < offset + 8 {
                    return Err(PacketError::TruncatedHeader {
                        expected: offset + 8,
                        actual: bytes.len(),
                    }
                    .into());
                }
                let id = PeerId::from_bytes(&bytes[offset..offset + 8]);
                offset += 8;
                Some(id)
            }
        };

        if bytes.len() < offset + 2 {
            return Err(PacketError::TruncatedHeader {
                expected: offset + 2,
                actual: bytes.len(),
            }
            .into());
        }
        let payload_len =
            u16::from_be_bytes(bytes[offset..offset + 2].try_into().expect("length checked"))
                as usize;
        offset += 2;

        if bytes.len() < offset + payload_len {
            return Err(PacketError::TruncatedPayload {
                declared: payload_len,
                remaining: bytes.len() - offset,
            }
            .into());
        }
        let payload = bytes[offset..offset + payload_len].to_vec();
        offset += payload_len;

        if bytes.len() < offset + 1 {
            return Err(PacketError::TruncatedHeader {
                expected: offset + 1,
                actual: bytes.len(),
            }
            .into());
        }
        let signature = match bytes[offset] {
            0 => {
                offset += 1;
                None
            }
            _ => {
                offset += 1;
                if bytes.len() < offset + 64 {
                    return Err(PacketError::TruncatedHeader {
                        expected: offset + 64,
                        actual: bytes.len(),
                    }
                    .into());
                }
                let mut sig = [0u8; 64];
                sig.copy_from_slice(&bytes[offset..offset + 64]);
                Some(sig)
            }
        };

        Ok(Self {
            version,
            message_type,
            ttl,
            timestamp,
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }

    /// Unpadded encoded length of this packet
    pub fn structural_len(&self) -> usize {
        FIXED_HEADER_LEN
            + self.recipient_id.map_or(0, |_| 8)
            + 2
            + self.payload.len()
            + 1
            + self.signature.map_or(0, |_| 64)
    }
}

// ----------------------------------------------------------------------------
// Padding
// ----------------------------------------------------------------------------

/// Pad in place to the next bucket, writing the unpadded length as the last
/// two bytes. Frames that cannot fit a bucket stay as they are.
fn pad_to_bucket(bytes: &mut Vec<u8>) {
    let unpadded = bytes.len();
    let Some(bucket) = bucket_for(unpadded) else {
        return;
    };

    let mut filler = vec![0u8; bucket - unpadded];
    rand::thread_rng().fill_bytes(&mut filler);
    bytes.extend_from_slice(&filler);
    let trailer = (unpadded as u16).to_be_bytes();
    let len = bytes.len();
    bytes[len - PAD_TRAILER_LEN..].copy_from_slice(&trailer);
}

/// The bucket a frame of `unpadded` bytes pads into, if any
fn bucket_for(unpadded: usize) -> Option<usize> {
    PADDING_BUCKETS
        .iter()
        .copied()
        .find(|&bucket| bucket >= unpadded + PAD_TRAILER_LEN)
}

/// Total on-air length of the frame starting at `buf[0]`, assuming the
/// sender padded it. Returns None until enough header bytes are buffered.
///
/// Used by links to delimit complete frames in a notify byte stream.
pub fn frame_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < FIXED_HEADER_LEN {
        return None;
    }
    let mut structural = FIXED_HEADER_LEN;
    if buf[19] != 0 {
        structural += 8;
    }
    if buf.len() < structural + 2 {
        return None;
    }
    let payload_len =
        u16::from_be_bytes(buf[structural..structural + 2].try_into().expect("checked")) as usize;
    structural += 2 + payload_len;

    // signature flag sits right after the payload
    if buf.len() <= structural {
        return None;
    }
    if buf[structural] != 0 {
        structural += 64;
    }
    structural += 1;

    Some(bucket_for(structural).unwrap_or(structural))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> BitchatPacket {
        BitchatPacket::new(
            MessageType::Message,
            PeerId::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]),
            Timestamp::new(1_700_000_000_000),
            b"hello mesh".to_vec(),
        )
    }

    #[test]
    fn test_encode_decode_broadcast() {
        let packet = sample_packet();
        let bytes = packet.encode(false).unwrap();
        let decoded = BitchatPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_broadcast());
    }

    #[test]
    fn test_encode_decode_directed_with_signature() {
        let identity = IdentityKeyPair::generate();
        let mut packet = sample_packet().with_recipient(PeerId::new([9; 8]));
        packet.sign(&identity);

        let bytes = packet.encode(false).unwrap();
        let decoded = BitchatPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        decoded
            .verify_signature(&identity.public_key_bytes())
            .unwrap();
    }

    #[test]
    fn test_signature_excludes_ttl() {
        let identity = IdentityKeyPair::generate();
        let mut packet = sample_packet();
        packet.sign(&identity);
        // A relay decrementing TTL must not invalidate the signature.
        packet.ttl = packet.ttl.decrement().unwrap();
        packet
            .verify_signature(&identity.public_key_bytes())
            .unwrap();
    }

    #[test]
    fn test_padding_buckets() {
        let packet = sample_packet();
        let padded = packet.encode(true).unwrap();
        assert_eq!(padded.len(), 256);

        // Padded frames still decode, padding ignored.
        let decoded = BitchatPacket::decode(&padded).unwrap();
        assert_eq!(decoded, packet);

        // The trailer records the unpadded length.
        let unpadded = packet.encode(false).unwrap();
        let trailer = u16::from_be_bytes([padded[254], padded[255]]) as usize;
        assert_eq!(trailer, unpadded.len());
    }

    #[test]
    fn test_padding_bucket_progression() {
        for (payload_len, expected) in [(10usize, 256usize), (300, 512), (600, 1024), (3000, 4096)]
        {
            let mut packet = sample_packet();
            packet.payload = vec![0xAA; payload_len];
            let padded = packet.encode(true).unwrap();
            assert_eq!(padded.len(), expected, "payload_len={}", payload_len);
        }
    }

    #[test]
    fn test_oversize_frame_unpadded() {
        let mut packet = sample_packet();
        packet.payload = vec![0xAA; 4200];
        let encoded = packet.encode(true).unwrap();
        assert_eq!(encoded.len(), packet.structural_len());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = sample_packet().encode(false).unwrap();
        bytes[0] = 3;
        match BitchatPacket::decode(&bytes) {
            Err(crate::BitchatError::Packet(PacketError::UnknownVersion(3))) => {}
            other => panic!("expected UnknownVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let mut bytes = sample_packet().encode(false).unwrap();
        bytes[1] = 0x7F;
        match BitchatPacket::decode(&bytes) {
            Err(crate::BitchatError::Packet(PacketError::UnsupportedType(0x7F))) => {}
            other => panic!("expected UnsupportedType, got {:?}", other),
        }
    }

    #[test]
    fn test_truncation_rejected() {
        let bytes = sample_packet().encode(false).unwrap();
        for cut in [0, 5, FIXED_HEADER_LEN, bytes.len() - 1] {
            assert!(
                BitchatPacket::decode(&bytes[..cut]).is_err(),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn test_frame_length_matches_padded_encoding() {
        for payload_len in [0usize, 10, 300, 600, 3000, 4200] {
            let mut packet = sample_packet();
            packet.payload = vec![0x55; payload_len];
            let padded = packet.encode(true).unwrap();
            assert_eq!(frame_length(&padded), Some(padded.len()));

            // frame_length works from a prefix too, once the header is in
            let prefix = &padded[..FIXED_HEADER_LEN + 2 + payload_len.min(64) + 16];
            if let Some(len) = frame_length(prefix) {
                assert_eq!(len, padded.len());
            }
        }
    }

    #[test]
    fn test_frame_length_needs_header() {
        assert_eq!(frame_length(&[0u8; 4]), None);
    }
}
