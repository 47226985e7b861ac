//! Relay message envelope
//!
//! The sealed rumor's content field carries a `bitchat1:`-prefixed base64
//! JSON envelope, so BitChat traffic is distinguishable from ordinary
//! NIP-17 DMs sent to the same key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::NostrTransportError;

/// Content prefix marking BitChat relay traffic
pub const BITCHAT_CONTENT_PREFIX: &str = "bitchat1:";

/// What kind of mesh operation this envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMessageKind {
    PrivateMessage,
    DeliveryAck,
    ReadReceipt,
    Favorite,
}

/// One relay-borne message, mirroring the mesh's private payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub kind: RelayMessageKind,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
}

impl RelayEnvelope {
    pub fn private_message(message_id: &str, content: &str, nickname: &str) -> Self {
        Self {
            kind: RelayMessageKind::PrivateMessage,
            message_id: message_id.to_string(),
            content: Some(content.to_string()),
            nickname: Some(nickname.to_string()),
            is_favorite: None,
        }
    }

    pub fn delivery_ack(message_id: &str) -> Self {
        Self {
            kind: RelayMessageKind::DeliveryAck,
            message_id: message_id.to_string(),
            content: None,
            nickname: None,
            is_favorite: None,
        }
    }

    pub fn read_receipt(message_id: &str) -> Self {
        Self {
            kind: RelayMessageKind::ReadReceipt,
            message_id: message_id.to_string(),
            content: None,
            nickname: None,
            is_favorite: None,
        }
    }

    pub fn favorite(is_favorite: bool) -> Self {
        Self {
            kind: RelayMessageKind::Favorite,
            message_id: String::new(),
            content: None,
            nickname: None,
            is_favorite: Some(is_favorite),
        }
    }

    /// Render as rumor content
    pub fn to_content(&self) -> Result<String, NostrTransportError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| NostrTransportError::EnvelopeDecode(e.to_string()))?;
        Ok(format!("{}{}", BITCHAT_CONTENT_PREFIX, BASE64.encode(json)))
    }

    /// Parse rumor content; `ForeignMessage` when the prefix is absent
    pub fn from_content(content: &str) -> Result<Self, NostrTransportError> {
        let encoded = content
            .strip_prefix(BITCHAT_CONTENT_PREFIX)
            .ok_or(NostrTransportError::ForeignMessage)?;
        let json = BASE64
            .decode(encoded)
            .map_err(|e| NostrTransportError::EnvelopeDecode(e.to_string()))?;
        serde_json::from_slice(&json)
            .map_err(|e| NostrTransportError::EnvelopeDecode(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
