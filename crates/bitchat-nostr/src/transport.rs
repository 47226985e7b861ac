//! Nostr transport implementation
//!
//! Publishes sealed gift-wrapped events addressed to the recipient's relay
//! public key, and subscribes to wraps addressed to ours. A peer is
//! relay-reachable exactly when the favorites registry holds a relay key
//! for it (learned from favorite notifications on the mesh).

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use nostr_sdk::nips::nip59::UnwrappedGift;
use nostr_sdk::{
    Client, EventBuilder, Filter, Keys, Kind, PublicKey, RelayPoolNotification, Timestamp,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use bitchat_core::event::{AppEvent, EventEmitter};
use bitchat_core::identity::FavoritesRegistry;
use bitchat_core::transport::{Transport, TransportKind};
use bitchat_core::{PeerId, Result};

use crate::config::NostrConfig;
use crate::envelope::{RelayEnvelope, RelayMessageKind};
use crate::error::NostrTransportError;

/// Relay fallback transport
pub struct NostrTransport {
    config: NostrConfig,
    keys: Keys,
    client: Client,
    favorites: Arc<RwLock<FavoritesRegistry>>,
    events: EventEmitter,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NostrTransport {
    pub fn new(
        config: NostrConfig,
        favorites: Arc<RwLock<FavoritesRegistry>>,
        events: EventEmitter,
    ) -> Self {
        let keys = config.keys.clone().unwrap_or_else(Keys::generate);
        let client = Client::new(keys.clone());
        Self {
            config,
            keys,
            client,
            favorites,
            events,
            listener: Mutex::new(None),
        }
    }

    /// Our relay public key, as shared with favorites
    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Connect to the configured relays and start surfacing inbound wraps
    pub async fn start(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        for relay in &self.config.relays {
            self.client
                .add_relay(relay.clone())
                .await
                .map_err(NostrTransportError::from)?;
        }
        self.client.connect().await;

        let filter = Filter::new()
            .kind(Kind::GiftWrap)
            .pubkey(self.keys.public_key())
            .since(Timestamp::now());
        self.client
            .subscribe(vec![filter], None)
            .await
            .map_err(NostrTransportError::from)?;
        info!(relays = self.config.relays.len(), "relay transport connected");

        let client = self.client.clone();
        let keys = self.keys.clone();
        let favorites = self.favorites.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let mut notifications = client.notifications();
            while let Ok(notification) = notifications.recv().await {
                let RelayPoolNotification::Event { event, .. } = notification else {
                    continue;
                };
                if event.kind != Kind::GiftWrap {
                    continue;
                }
                match UnwrappedGift::from_gift_wrap(&keys, &event) {
                    Ok(unwrapped) => {
                        handle_inbound(&favorites, &events, unwrapped);
                    }
                    Err(e) => debug!("gift unwrap failed: {}", e),
                }
            }
        });
        *listener = Some(handle);
        Ok(())
    }

    /// Disconnect from the relays and stop the listener
    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        let _ = self.client.disconnect().await;
        Ok(())
    }

    fn relay_key_for(&self, peer: PeerId) -> Result<PublicKey> {
        let hex = self
            .favorites
            .read()
            .expect("favorites lock")
            .nostr_pubkey_for_peer(peer)
            .ok_or_else(|| NostrTransportError::NoRelayKey {
                peer_id: peer.to_string(),
            })?;
        PublicKey::parse(&hex)
            .map_err(|e| NostrTransportError::InvalidKey(e.to_string()).into())
    }

    /// Seal the envelope for `receiver` and publish it
    async fn publish(&self, receiver: PublicKey, envelope: RelayEnvelope) -> Result<()> {
        let content = envelope.to_content()?;
        let rumor = EventBuilder::new(Kind::from(self.config.dm_kind), content, [])
            .to_unsigned_event(self.keys.public_key());
        let wrap = EventBuilder::gift_wrap(&self.keys, &receiver, rumor, None)
            .map_err(|e| NostrTransportError::WrapFailed(e.to_string()))?;
        self.client
            .send_event(wrap)
            .await
            .map_err(NostrTransportError::from)?;
        debug!(%receiver, "relay message published");
        Ok(())
    }
}

/// Map one unwrapped gift into application events
fn handle_inbound(
    favorites: &Arc<RwLock<FavoritesRegistry>>,
    events: &EventEmitter,
    unwrapped: UnwrappedGift,
) {
    let envelope = match RelayEnvelope::from_content(&unwrapped.rumor.content) {
        Ok(envelope) => envelope,
        Err(NostrTransportError::ForeignMessage) => return,
        Err(e) => {
            debug!("bad relay envelope: {}", e);
            return;
        }
    };

    let sender_hex = unwrapped.sender.to_hex();
    let Some(peer_id) = favorites
        .read()
        .expect("favorites lock")
        .peer_for_nostr_pubkey(&sender_hex)
    else {
        warn!("relay message from unknown sender key, dropped");
        return;
    };

    match envelope.kind {
        RelayMessageKind::PrivateMessage => {
            events.emit(AppEvent::PrivateMessageReceived {
                peer_id,
                message_id: envelope.message_id,
                content: envelope.content.unwrap_or_default(),
                timestamp: bitchat_core::Timestamp::new(
                    unwrapped.rumor.created_at.as_u64() * 1000,
                ),
            });
        }
        RelayMessageKind::DeliveryAck => {
            events.emit(AppEvent::DeliveryAckReceived {
                peer_id,
                message_id: envelope.message_id,
            });
        }
        RelayMessageKind::ReadReceipt => {
            events.emit(AppEvent::ReadReceiptReceived {
                peer_id,
                message_id: envelope.message_id,
            });
        }
        RelayMessageKind::Favorite => {
            events.emit(AppEvent::FavoriteStatusChanged {
                peer_id,
                is_favorite: envelope.is_favorite.unwrap_or(false),
            });
        }
    }
}

#[async_trait]
impl Transport for NostrTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn is_peer_reachable(&self, peer: PeerId) -> bool {
        self.favorites
            .read()
            .expect("favorites lock")
            .nostr_pubkey_for_peer(peer)
            .is_some()
    }

    async fn send_private_message(
        &self,
        content: &str,
        to: PeerId,
        recipient_nickname: &str,
        message_id: &str,
    ) -> Result<()> {
        let receiver = self.relay_key_for(to)?;
        self.publish(
            receiver,
            RelayEnvelope::private_message(message_id, content, recipient_nickname),
        )
        .await
    }

    async fn send_read_receipt(&self, to: PeerId, message_id: &str) -> Result<()> {
        let receiver = self.relay_key_for(to)?;
        self.publish(receiver, RelayEnvelope::read_receipt(message_id))
            .await
    }

    async fn send_delivery_ack(&self, to: PeerId, message_id: &str) -> Result<()> {
        let receiver = self.relay_key_for(to)?;
        self.publish(receiver, RelayEnvelope::delivery_ack(message_id))
            .await
    }

    async fn send_favorite_notification(&self, to: PeerId, is_favorite: bool) -> Result<()> {
        let receiver = self.relay_key_for(to)?;
        self.publish(receiver, RelayEnvelope::favorite(is_favorite))
            .await
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitchat_core::event::null_emitter;
    use bitchat_core::identity::generate_fingerprint;

    fn transport_with_favorites() -> (NostrTransport, Arc<RwLock<FavoritesRegistry>>, PeerId, Keys)
    {
        let favorites = Arc::new(RwLock::new(FavoritesRegistry::new()));
        let remote_keys = Keys::generate();
        let fingerprint = generate_fingerprint([7u8; 32]);
        let peer_id = fingerprint.to_peer_id();
        {
            let mut favorites = favorites.write().unwrap();
            favorites.note_peer(peer_id, fingerprint, "bob");
            favorites.set_nostr_pubkey(fingerprint, Some(remote_keys.public_key().to_hex()));
        }
        let transport = NostrTransport::new(
            NostrConfig::default().with_keys(Keys::generate()),
            favorites.clone(),
            null_emitter(),
        );
        (transport, favorites, peer_id, remote_keys)
    }

    #[tokio::test]
    async fn test_reachability_follows_favorites() {
        let (transport, favorites, peer_id, _) = transport_with_favorites();
        assert!(transport.is_peer_reachable(peer_id));

        let unknown = PeerId::new([0xEE; 8]);
        assert!(!transport.is_peer_reachable(unknown));

        favorites.write().unwrap().clear();
        assert!(!transport.is_peer_reachable(peer_id));
    }

    #[tokio::test]
    async fn test_relay_key_resolution() {
        let (transport, _favorites, peer_id, remote_keys) = transport_with_favorites();
        let key = transport.relay_key_for(peer_id).unwrap();
        assert_eq!(key, remote_keys.public_key());

        assert!(transport.relay_key_for(PeerId::new([0xEE; 8])).is_err());
    }
}
