//! In-memory test fabric
//!
//! A [`MemoryLinkHub`] wires several [`MemoryLink`]s together with an
//! explicit adjacency, so multi-node mesh behavior (flooding, TTL,
//! store-and-forward of fragments) runs deterministically with no radio.
//! Link ids are the hub-assigned node indices of the neighbors.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::link::{LinkEvent, LinkId, MeshLink};

// ----------------------------------------------------------------------------
// Hub
// ----------------------------------------------------------------------------

#[derive(Default)]
struct HubInner {
    senders: HashMap<u64, mpsc::Sender<LinkEvent>>,
    edges: HashSet<(u64, u64)>,
    /// frames are dropped instead of delivered while a node is down
    down: HashSet<u64>,
}

/// Fabric connecting memory links by node id
#[derive(Clone, Default)]
pub struct MemoryLinkHub {
    inner: Arc<Mutex<HubInner>>,
    next_node: Arc<Mutex<u64>>,
}

impl MemoryLinkHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a link for a new node on this hub
    pub fn new_link(&self) -> Arc<MemoryLink> {
        let mut next = self.next_node.lock().expect("hub lock");
        let node = *next;
        *next += 1;
        Arc::new(MemoryLink {
            hub: self.clone(),
            node,
            mtu: 512,
            events: Mutex::new(None),
        })
    }

    /// Connect two nodes; both sides observe a link-up
    pub async fn connect(&self, a: &MemoryLink, b: &MemoryLink) {
        let (sender_a, sender_b) = {
            let mut inner = self.inner.lock().expect("hub lock");
            inner.edges.insert((a.node, b.node));
            inner.edges.insert((b.node, a.node));
            (
                inner.senders.get(&a.node).cloned(),
                inner.senders.get(&b.node).cloned(),
            )
        };
        if let Some(sender) = sender_a {
            let _ = sender.send(LinkEvent::Connected { link: b.node }).await;
        }
        if let Some(sender) = sender_b {
            let _ = sender.send(LinkEvent::Connected { link: a.node }).await;
        }
    }

    /// Disconnect two nodes; both sides observe a link-down
    pub async fn disconnect(&self, a: &MemoryLink, b: &MemoryLink) {
        let (sender_a, sender_b) = {
            let mut inner = self.inner.lock().expect("hub lock");
            inner.edges.remove(&(a.node, b.node));
            inner.edges.remove(&(b.node, a.node));
            (
                inner.senders.get(&a.node).cloned(),
                inner.senders.get(&b.node).cloned(),
            )
        };
        if let Some(sender) = sender_a {
            let _ = sender.send(LinkEvent::Disconnected { link: b.node }).await;
        }
        if let Some(sender) = sender_b {
            let _ = sender.send(LinkEvent::Disconnected { link: a.node }).await;
        }
    }

    async fn deliver(&self, from: u64, to: u64, frame: Vec<u8>) {
        let sender = {
            let inner = self.inner.lock().expect("hub lock");
            if !inner.edges.contains(&(from, to)) || inner.down.contains(&to) {
                None
            } else {
                inner.senders.get(&to).cloned()
            }
        };
        if let Some(sender) = sender {
            let _ = sender
                .send(LinkEvent::FrameReceived { link: from, frame })
                .await;
        }
    }

    fn neighbors(&self, node: u64) -> Vec<u64> {
        let inner = self.inner.lock().expect("hub lock");
        inner
            .edges
            .iter()
            .filter(|(from, _)| *from == node)
            .map(|(_, to)| *to)
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Link
// ----------------------------------------------------------------------------

/// One node's link onto the hub
pub struct MemoryLink {
    hub: MemoryLinkHub,
    node: u64,
    mtu: usize,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl MemoryLink {
    /// Hub-assigned node id (doubles as the neighbors' LinkId for us)
    pub fn node_id(&self) -> u64 {
        self.node
    }
}

#[async_trait]
impl MeshLink for MemoryLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn attach_events(&self, events: mpsc::Sender<LinkEvent>) {
        let mut hub = self.hub.inner.lock().expect("hub lock");
        hub.senders.insert(self.node, events.clone());
        *self.events.lock().expect("events lock") = Some(events);
    }

    async fn start(&self) -> Result<()> {
        self.hub
            .inner
            .lock()
            .expect("hub lock")
            .down
            .remove(&self.node);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.hub
            .inner
            .lock()
            .expect("hub lock")
            .down
            .insert(self.node);
        Ok(())
    }

    async fn send_frame(&self, link: LinkId, frame: &[u8]) -> Result<()> {
        self.hub.deliver(self.node, link, frame.to_vec()).await;
        Ok(())
    }

    async fn broadcast_frame(&self, frame: &[u8], exclude: Option<LinkId>) -> Result<()> {
        for neighbor in self.hub.neighbors(self.node) {
            if Some(neighbor) == exclude {
                continue;
            }
            self.hub.deliver(self.node, neighbor, frame.to_vec()).await;
        }
        Ok(())
    }

    fn connected_links(&self) -> Vec<LinkId> {
        self.hub.neighbors(self.node)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_delivers_between_connected_nodes() {
        let hub = MemoryLinkHub::new();
        let a = hub.new_link();
        let b = hub.new_link();

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        a.attach_events(tx_a);
        b.attach_events(tx_b);
        hub.connect(&a, &b).await;

        // both sides saw the link come up
        assert!(matches!(
            rx_a.recv().await,
            Some(LinkEvent::Connected { .. })
        ));
        assert!(matches!(
            rx_b.recv().await,
            Some(LinkEvent::Connected { .. })
        ));

        a.send_frame(b.node_id(), b"frame").await.unwrap();
        match rx_b.recv().await {
            Some(LinkEvent::FrameReceived { link, frame }) => {
                assert_eq!(link, a.node_id());
                assert_eq!(frame, b"frame");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let hub = MemoryLinkHub::new();
        let a = hub.new_link();
        let b = hub.new_link();
        let c = hub.new_link();

        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);
        a.attach_events(tx_a);
        b.attach_events(tx_b);
        c.attach_events(tx_c);
        hub.connect(&a, &b).await;
        hub.connect(&a, &c).await;
        let _ = rx_b.recv().await;
        let _ = rx_c.recv().await;

        a.broadcast_frame(b"hello", Some(b.node_id())).await.unwrap();
        assert!(matches!(
            rx_c.recv().await,
            Some(LinkEvent::FrameReceived { .. })
        ));
        assert!(rx_b.try_recv().is_err());
    }
}
