//! Message router
//!
//! Sits above the transports (mesh first, relay fallback) and picks one per
//! recipient. Private messages with no reachable transport wait in a
//! per-peer outbox; favorite status changes trigger a flush, and entries
//! that outlive their deadline surface as `MessageUnreachable`. Receipts
//! and acks are best-effort and never queued. Public messages are mesh-only
//! and do not pass through the router.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::errors::Result;
use crate::event::{AppEvent, EventEmitter};
use crate::transport::Transport;
use crate::types::{PeerId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Outbox
// ----------------------------------------------------------------------------

/// A private message waiting for a reachable transport
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub content: String,
    pub recipient_nickname: String,
    pub message_id: String,
    pub queued_at: Timestamp,
    pub deadline: Timestamp,
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

/// Per-recipient transport selection plus the outbox
pub struct MessageRouter {
    transports: Vec<Arc<dyn Transport>>,
    outbox: Mutex<HashMap<PeerId, Vec<OutboxMessage>>>,
    config: RouterConfig,
    time: Arc<dyn TimeSource>,
    events: EventEmitter,
}

impl MessageRouter {
    /// Create a router over an ordered transport list (first match wins)
    pub fn new(
        transports: Vec<Arc<dyn Transport>>,
        config: RouterConfig,
        time: Arc<dyn TimeSource>,
        events: EventEmitter,
    ) -> Self {
        Self {
            transports,
            outbox: Mutex::new(HashMap::new()),
            config,
            time,
            events,
        }
    }

    /// First transport that currently reaches `peer`
    fn select(&self, peer: PeerId) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.is_peer_reachable(peer))
    }

    /// Whether any transport reaches `peer`
    pub fn is_peer_reachable(&self, peer: PeerId) -> bool {
        self.select(peer).is_some()
    }

    /// Send a private message, queueing it when nothing reaches the peer
    pub async fn send_private_message(
        &self,
        content: &str,
        to: PeerId,
        recipient_nickname: &str,
        message_id: &str,
    ) -> Result<()> {
        if let Some(transport) = self.select(to) {
            debug!(peer = %to, transport = %transport.kind(), "routing private message");
            return transport
                .send_private_message(content, to, recipient_nickname, message_id)
                .await;
        }

        let now = self.time.now();
        let entry = OutboxMessage {
            content: content.to_string(),
            recipient_nickname: recipient_nickname.to_string(),
            message_id: message_id.to_string(),
            queued_at: now,
            deadline: now.plus_millis(self.config.outbox_ttl.as_millis() as u64),
        };
        info!(peer = %to, message_id, "no reachable transport, queueing in outbox");
        self.outbox
            .lock()
            .expect("outbox lock")
            .entry(to)
            .or_default()
            .push(entry);
        Ok(())
    }

    /// Best-effort read receipt; never queued
    pub async fn send_read_receipt(&self, to: PeerId, message_id: &str) -> Result<()> {
        match self.select(to) {
            Some(transport) => transport.send_read_receipt(to, message_id).await,
            None => Err(crate::BitchatError::unreachable(to)),
        }
    }

    /// Best-effort delivery ack; never queued
    pub async fn send_delivery_ack(&self, to: PeerId, message_id: &str) -> Result<()> {
        match self.select(to) {
            Some(transport) => transport.send_delivery_ack(to, message_id).await,
            None => Err(crate::BitchatError::unreachable(to)),
        }
    }

    /// Best-effort favorite notification; never queued
    pub async fn send_favorite_notification(&self, to: PeerId, is_favorite: bool) -> Result<()> {
        match self.select(to) {
            Some(transport) => transport.send_favorite_notification(to, is_favorite).await,
            None => Err(crate::BitchatError::unreachable(to)),
        }
    }

    /// A favorite mapping changed for `peer`: try to drain its outbox
    pub async fn on_favorite_status_changed(&self, peer: PeerId) {
        self.flush_outbox(peer).await;
    }

    /// Dispatch queued messages that now find a transport; the rest stay
    pub async fn flush_outbox(&self, peer: PeerId) {
        let queued = {
            let mut outbox = self.outbox.lock().expect("outbox lock");
            outbox.remove(&peer).unwrap_or_default()
        };
        if queued.is_empty() {
            return;
        }

        let mut remaining = Vec::new();
        for entry in queued {
            match self.select(peer) {
                Some(transport) => {
                    let sent = transport
                        .send_private_message(
                            &entry.content,
                            peer,
                            &entry.recipient_nickname,
                            &entry.message_id,
                        )
                        .await;
                    match sent {
                        Ok(()) => {
                            debug!(peer = %peer, message_id = %entry.message_id, "outbox entry dispatched")
                        }
                        Err(e) => {
                            warn!(peer = %peer, "outbox dispatch failed: {}", e);
                            remaining.push(entry);
                        }
                    }
                }
                None => remaining.push(entry),
            }
        }

        if !remaining.is_empty() {
            self.outbox
                .lock()
                .expect("outbox lock")
                .entry(peer)
                .or_default()
                .extend(remaining);
        }
    }

    /// Drop entries past their deadline and surface `MessageUnreachable`
    pub fn expire_tick(&self) {
        let now = self.time.now();
        let mut outbox = self.outbox.lock().expect("outbox lock");
        for (peer, entries) in outbox.iter_mut() {
            entries.retain(|entry| {
                if now > entry.deadline {
                    warn!(peer = %peer, message_id = %entry.message_id, "outbox entry expired");
                    self.events.emit(AppEvent::MessageUnreachable {
                        peer_id: *peer,
                        message_id: entry.message_id.clone(),
                    });
                    false
                } else {
                    true
                }
            });
        }
        outbox.retain(|_, entries| !entries.is_empty());
    }

    /// Queued message count for a peer
    pub fn outbox_len(&self, peer: PeerId) -> usize {
        self.outbox
            .lock()
            .expect("outbox lock")
            .get(&peer)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Drop every queued message (panic clear)
    pub fn clear(&self) {
        self.outbox.lock().expect("outbox lock").clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::null_emitter;
    use crate::transport::TransportKind;
    use crate::types::ManualTimeSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeTransport {
        reachable: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Local
        }

        fn is_peer_reachable(&self, _peer: PeerId) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        async fn send_private_message(
            &self,
            _content: &str,
            _to: PeerId,
            _nickname: &str,
            message_id: &str,
        ) -> Result<()> {
            self.sent.lock().unwrap().push(message_id.to_string());
            Ok(())
        }

        async fn send_read_receipt(&self, _to: PeerId, _message_id: &str) -> Result<()> {
            Ok(())
        }

        async fn send_delivery_ack(&self, _to: PeerId, _message_id: &str) -> Result<()> {
            Ok(())
        }

        async fn send_favorite_notification(&self, _to: PeerId, _is_favorite: bool) -> Result<()> {
            Ok(())
        }
    }

    fn peer() -> PeerId {
        PeerId::new([9; 8])
    }

    fn router_with(
        transport: Arc<FakeTransport>,
        clock: ManualTimeSource,
    ) -> MessageRouter {
        MessageRouter::new(
            vec![transport],
            RouterConfig::default(),
            Arc::new(clock),
            null_emitter(),
        )
    }

    #[tokio::test]
    async fn test_reachable_peer_sends_directly() {
        let transport = Arc::new(FakeTransport::default());
        transport.set_reachable(true);
        let router = router_with(transport.clone(), ManualTimeSource::new(0));

        router
            .send_private_message("hi", peer(), "bob", "m1")
            .await
            .unwrap();
        assert_eq!(transport.sent(), vec!["m1"]);
        assert_eq!(router.outbox_len(peer()), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_queues() {
        let transport = Arc::new(FakeTransport::default());
        let router = router_with(transport.clone(), ManualTimeSource::new(0));

        router
            .send_private_message("hi", peer(), "bob", "m1")
            .await
            .unwrap();
        assert!(transport.sent().is_empty());
        assert_eq!(router.outbox_len(peer()), 1);
    }

    #[tokio::test]
    async fn test_favorite_change_flushes_outbox() {
        let transport = Arc::new(FakeTransport::default());
        let router = router_with(transport.clone(), ManualTimeSource::new(0));

        router
            .send_private_message("one", peer(), "bob", "m1")
            .await
            .unwrap();
        router
            .send_private_message("two", peer(), "bob", "m2")
            .await
            .unwrap();
        assert_eq!(router.outbox_len(peer()), 2);

        transport.set_reachable(true);
        router.on_favorite_status_changed(peer()).await;
        assert_eq!(transport.sent(), vec!["m1", "m2"]);
        assert_eq!(router.outbox_len(peer()), 0);
    }

    #[tokio::test]
    async fn test_flush_keeps_unroutable_entries() {
        let transport = Arc::new(FakeTransport::default());
        let router = router_with(transport.clone(), ManualTimeSource::new(0));

        router
            .send_private_message("one", peer(), "bob", "m1")
            .await
            .unwrap();
        router.flush_outbox(peer()).await;
        assert_eq!(router.outbox_len(peer()), 1);
    }

    #[tokio::test]
    async fn test_expiry_surfaces_unreachable() {
        let transport = Arc::new(FakeTransport::default());
        let clock = ManualTimeSource::new(0);
        let router = router_with(transport, clock.clone());

        router
            .send_private_message("one", peer(), "bob", "m1")
            .await
            .unwrap();

        clock.advance(299_000);
        router.expire_tick();
        assert_eq!(router.outbox_len(peer()), 1);

        clock.advance(2_000);
        router.expire_tick();
        assert_eq!(router.outbox_len(peer()), 0);
    }

    #[tokio::test]
    async fn test_receipts_never_queue() {
        let transport = Arc::new(FakeTransport::default());
        let router = router_with(transport, ManualTimeSource::new(0));

        assert!(router.send_read_receipt(peer(), "m1").await.is_err());
        assert!(router.send_delivery_ack(peer(), "m1").await.is_err());
        assert_eq!(router.outbox_len(peer()), 0);
    }
}
