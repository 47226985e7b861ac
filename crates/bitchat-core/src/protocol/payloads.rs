//! Typed payload codecs for the individual message kinds
//!
//! Packet payloads use the same hand-rolled big-endian conventions as the
//! outer wire format: u8-length-prefixed strings up front, free-running
//! bytes at the tail.

use crate::errors::{PacketError, Result};

// ----------------------------------------------------------------------------
// Codec Helpers
// ----------------------------------------------------------------------------

fn push_short_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u8::MAX as usize {
        return Err(PacketError::Malformed(format!("string of {} bytes too long", s.len())).into());
    }
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_short_string<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a str> {
    let remaining = &bytes[*offset..];
    if remaining.is_empty() {
        return Err(PacketError::TruncatedPayload {
            declared: 1,
            remaining: 0,
        }
        .into());
    }
    let len = remaining[0] as usize;
    if remaining.len() < 1 + len {
        return Err(PacketError::TruncatedPayload {
            declared: len,
            remaining: remaining.len() - 1,
        }
        .into());
    }
    let s = std::str::from_utf8(&remaining[1..1 + len])
        .map_err(|_| PacketError::Malformed("invalid utf-8 in payload string".into()))?;
    *offset += 1 + len;
    Ok(s)
}

fn read_array<const N: usize>(bytes: &[u8], offset: &mut usize) -> Result<[u8; N]> {
    let remaining = &bytes[*offset..];
    if remaining.len() < N {
        return Err(PacketError::TruncatedPayload {
            declared: N,
            remaining: remaining.len(),
        }
        .into());
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&remaining[..N]);
    *offset += N;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Announce
// ----------------------------------------------------------------------------

/// Presence beacon: nickname plus both long-term public keys.
///
/// The enclosing packet is signed with the identity key; receivers verify
/// that signature and that the sender id matches the fingerprint of the
/// Noise static key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePayload {
    pub nickname: String,
    pub noise_static_key: [u8; 32],
    pub identity_key: [u8; 32],
}

impl AnnouncePayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + self.nickname.len() + 64);
        push_short_string(&mut out, &self.nickname)?;
        out.extend_from_slice(&self.noise_static_key);
        out.extend_from_slice(&self.identity_key);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let nickname = read_short_string(bytes, &mut offset)?.to_string();
        let noise_static_key = read_array::<32>(bytes, &mut offset)?;
        let identity_key = read_array::<32>(bytes, &mut offset)?;
        Ok(Self {
            nickname,
            noise_static_key,
            identity_key,
        })
    }
}

// ----------------------------------------------------------------------------
// Chat Messages
// ----------------------------------------------------------------------------

/// Public broadcast chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicMessagePayload {
    pub message_id: String,
    pub content: String,
}

impl PublicMessagePayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + self.message_id.len() + self.content.len());
        push_short_string(&mut out, &self.message_id)?;
        out.extend_from_slice(self.content.as_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let message_id = read_short_string(bytes, &mut offset)?.to_string();
        let content = std::str::from_utf8(&bytes[offset..])
            .map_err(|_| PacketError::Malformed("invalid utf-8 in message content".into()))?
            .to_string();
        Ok(Self {
            message_id,
            content,
        })
    }
}

/// Private chat message; travels only inside a Noise transport envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessagePayload {
    pub message_id: String,
    pub content: String,
}

impl PrivateMessagePayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + self.message_id.len() + self.content.len());
        push_short_string(&mut out, &self.message_id)?;
        out.extend_from_slice(self.content.as_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let message_id = read_short_string(bytes, &mut offset)?.to_string();
        let content = std::str::from_utf8(&bytes[offset..])
            .map_err(|_| PacketError::Malformed("invalid utf-8 in message content".into()))?
            .to_string();
        Ok(Self {
            message_id,
            content,
        })
    }
}

// ----------------------------------------------------------------------------
// File Transfer
// ----------------------------------------------------------------------------

/// File transfer: optional metadata followed by the raw content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferPayload {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub content: Vec<u8>,
}

impl FileTransferPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out =
            Vec::with_capacity(2 + self.content.len() + 64);
        push_short_string(&mut out, self.file_name.as_deref().unwrap_or(""))?;
        push_short_string(&mut out, self.mime_type.as_deref().unwrap_or(""))?;
        out.extend_from_slice(&self.content);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let file_name = read_short_string(bytes, &mut offset)?;
        let file_name = (!file_name.is_empty()).then(|| file_name.to_string());
        let mime_type = read_short_string(bytes, &mut offset)?;
        let mime_type = (!mime_type.is_empty()).then(|| mime_type.to_string());
        Ok(Self {
            file_name,
            mime_type,
            content: bytes[offset..].to_vec(),
        })
    }
}

// ----------------------------------------------------------------------------
// Receipts
// ----------------------------------------------------------------------------

/// Delivery acknowledgment for a private message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAckPayload {
    pub message_id: String,
}

impl DeliveryAckPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + self.message_id.len());
        push_short_string(&mut out, &self.message_id)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let message_id = read_short_string(bytes, &mut offset)?.to_string();
        Ok(Self { message_id })
    }
}

/// Read receipt for a private message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceiptPayload {
    pub message_id: String,
}

impl ReadReceiptPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + self.message_id.len());
        push_short_string(&mut out, &self.message_id)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let message_id = read_short_string(bytes, &mut offset)?.to_string();
        Ok(Self { message_id })
    }
}

// ----------------------------------------------------------------------------
// Favorite
// ----------------------------------------------------------------------------

/// Favorite / unfavorite notification, optionally carrying the sender's
/// relay public key so the recipient can reach us off-mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavoritePayload {
    pub is_favorite: bool,
    pub nostr_pubkey: Option<String>,
}

impl FavoritePayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(2 + 64);
        out.push(self.is_favorite as u8);
        push_short_string(&mut out, self.nostr_pubkey.as_deref().unwrap_or(""))?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(PacketError::TruncatedPayload {
                declared: 1,
                remaining: 0,
            }
            .into());
        }
        let is_favorite = bytes[0] != 0;
        let mut offset = 1;
        let nostr_pubkey = read_short_string(bytes, &mut offset)?;
        let nostr_pubkey = (!nostr_pubkey.is_empty()).then(|| nostr_pubkey.to_string());
        Ok(Self {
            is_favorite,
            nostr_pubkey,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_roundtrip() {
        let payload = AnnouncePayload {
            nickname: "anon1234".into(),
            noise_static_key: [0x42; 32],
            identity_key: [0x17; 32],
        };
        let decoded = AnnouncePayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_announce_truncated() {
        let payload = AnnouncePayload {
            nickname: "anon".into(),
            noise_static_key: [0; 32],
            identity_key: [0; 32],
        };
        let bytes = payload.encode().unwrap();
        assert!(AnnouncePayload::decode(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_public_message_roundtrip() {
        let payload = PublicMessagePayload {
            message_id: "8f14e45f".into(),
            content: "hello everyone".into(),
        };
        let decoded = PublicMessagePayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_file_transfer_optional_fields() {
        let full = FileTransferPayload {
            file_name: Some("photo.png".into()),
            mime_type: Some("image/png".into()),
            content: vec![1, 2, 3, 4],
        };
        assert_eq!(
            FileTransferPayload::decode(&full.encode().unwrap()).unwrap(),
            full
        );

        let bare = FileTransferPayload {
            file_name: None,
            mime_type: None,
            content: vec![9; 100],
        };
        assert_eq!(
            FileTransferPayload::decode(&bare.encode().unwrap()).unwrap(),
            bare
        );
    }

    #[test]
    fn test_receipts_roundtrip() {
        let ack = DeliveryAckPayload {
            message_id: "msg-1".into(),
        };
        assert_eq!(
            DeliveryAckPayload::decode(&ack.encode().unwrap()).unwrap(),
            ack
        );

        let receipt = ReadReceiptPayload {
            message_id: "msg-2".into(),
        };
        assert_eq!(
            ReadReceiptPayload::decode(&receipt.encode().unwrap()).unwrap(),
            receipt
        );
    }

    #[test]
    fn test_favorite_roundtrip() {
        let payload = FavoritePayload {
            is_favorite: true,
            nostr_pubkey: Some("npub1examplekey".into()),
        };
        assert_eq!(
            FavoritePayload::decode(&payload.encode().unwrap()).unwrap(),
            payload
        );

        let off = FavoritePayload {
            is_favorite: false,
            nostr_pubkey: None,
        };
        assert_eq!(FavoritePayload::decode(&off.encode().unwrap()).unwrap(), off);
    }
}
