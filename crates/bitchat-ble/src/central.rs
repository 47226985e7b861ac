//! Central role: scanning, connecting, and per-connection plumbing
//!
//! Discovered peers advertising the BitChat service are connected with a
//! timeout, their `RX` characteristic subscribed for notifies, and a writer
//! task attached to their `TX` characteristic. Each live connection gets an
//! opaque [`LinkId`] and a bounded frame queue; queue overflow drops the
//! frame rather than stalling the mesh loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use bitchat_core::link::{LinkEvent, LinkId};

use crate::config::BleLinkConfig;
use crate::error::BleLinkError;
use crate::peer::BlePeer;
use crate::protocol::{
    FrameAssembler, BITCHAT_RX_CHARACTERISTIC_UUID, BITCHAT_SERVICE_UUID,
    BITCHAT_TX_CHARACTERISTIC_UUID,
};

// ----------------------------------------------------------------------------
// Connection Registry
// ----------------------------------------------------------------------------

/// One live connection's sending side
struct ConnectionHandle {
    address: String,
    frames: mpsc::Sender<Vec<u8>>,
}

/// Live connections shared between the central loop and the link facade
#[derive(Default)]
pub struct ConnectionRegistry {
    next_link: AtomicU64,
    connections: Mutex<HashMap<LinkId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, address: String, frames: mpsc::Sender<Vec<u8>>) -> LinkId {
        let link = self.next_link.fetch_add(1, Ordering::SeqCst);
        self.connections
            .lock()
            .expect("connection registry lock")
            .insert(link, ConnectionHandle { address, frames });
        link
    }

    fn remove(&self, link: LinkId) -> Option<String> {
        self.connections
            .lock()
            .expect("connection registry lock")
            .remove(&link)
            .map(|handle| handle.address)
    }

    /// Queue a frame for one connection; full queues drop (backpressure)
    pub fn send(&self, link: LinkId, frame: &[u8]) -> Result<(), BleLinkError> {
        let connections = self.connections.lock().expect("connection registry lock");
        let handle = connections
            .get(&link)
            .ok_or(BleLinkError::NotRunning)?;
        handle
            .frames
            .try_send(frame.to_vec())
            .map_err(|_| BleLinkError::WriteQueueFull { link })
    }

    /// Queue a frame for every connection except `exclude`
    pub fn broadcast(&self, frame: &[u8], exclude: Option<LinkId>) {
        let connections = self.connections.lock().expect("connection registry lock");
        for (link, handle) in connections.iter() {
            if Some(*link) == exclude {
                continue;
            }
            if handle.frames.try_send(frame.to_vec()).is_err() {
                warn!(link, "write queue full, frame dropped");
            }
        }
    }

    pub fn links(&self) -> Vec<LinkId> {
        self.connections
            .lock()
            .expect("connection registry lock")
            .keys()
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connections
            .lock()
            .expect("connection registry lock")
            .is_empty()
    }
}

// ----------------------------------------------------------------------------
// Central
// ----------------------------------------------------------------------------

/// Scanning + connection establishment on one adapter
pub struct BleCentral {
    config: BleLinkConfig,
    registry: Arc<ConnectionRegistry>,
}

impl BleCentral {
    pub fn new(config: BleLinkConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self { config, registry }
    }

    /// Run scanning and connecting until the adapter event stream ends or
    /// `shutdown` fires
    pub async fn run(
        &self,
        adapter: Adapter,
        events: mpsc::Sender<LinkEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), BleLinkError> {
        adapter
            .start_scan(ScanFilter {
                services: vec![BITCHAT_SERVICE_UUID],
            })
            .await?;
        info!("BLE scan started");

        let mut adapter_events = adapter.events().await?;
        let mut peers: HashMap<PeripheralId, BlePeer> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = adapter_events.next() => {
                    let Some(event) = event else { break };
                    if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
                        self.maybe_connect(&adapter, id, &mut peers, &events).await;
                    }
                }
            }
        }

        let _ = adapter.stop_scan().await;
        info!("BLE scan stopped");
        Ok(())
    }

    async fn maybe_connect(
        &self,
        adapter: &Adapter,
        id: PeripheralId,
        peers: &mut HashMap<PeripheralId, BlePeer>,
        events: &mpsc::Sender<LinkEvent>,
    ) {
        let now = tokio::time::Instant::now();
        let peer = peers
            .entry(id.clone())
            .or_insert_with(|| BlePeer::new(id.to_string()));
        if !peer.can_attempt(now) {
            return;
        }

        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!(%id, "peripheral lookup failed: {}", e);
                return;
            }
        };

        // only BitChat devices
        let advertises_service = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .map(|props| props.services.contains(&BITCHAT_SERVICE_UUID))
            .unwrap_or(false);
        if !advertises_service {
            return;
        }

        peer.mark_connecting();
        match self.connect(&peripheral, events).await {
            Ok(link) => {
                peer.mark_connected();
                info!(%id, link, "connected to peer");
            }
            Err(e) => {
                peer.mark_failed(&self.config, now);
                debug!(%id, failures = peer.failures, "connect failed: {}", e);
            }
        }
    }

    /// Connect, subscribe, and wire up the writer and reader tasks
    async fn connect(
        &self,
        peripheral: &Peripheral,
        events: &mpsc::Sender<LinkEvent>,
    ) -> Result<LinkId, BleLinkError> {
        let address = peripheral.id().to_string();

        timeout(self.config.connection_timeout, peripheral.connect())
            .await
            .map_err(|_| BleLinkError::ConnectionTimeout {
                address: address.clone(),
            })??;
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let tx_char = characteristics
            .iter()
            .find(|c| c.uuid == BITCHAT_TX_CHARACTERISTIC_UUID)
            .cloned()
            .ok_or(BleLinkError::CharacteristicMissing {
                uuid: BITCHAT_TX_CHARACTERISTIC_UUID,
            })?;
        let rx_char = characteristics
            .iter()
            .find(|c| c.uuid == BITCHAT_RX_CHARACTERISTIC_UUID)
            .cloned()
            .ok_or(BleLinkError::CharacteristicMissing {
                uuid: BITCHAT_RX_CHARACTERISTIC_UUID,
            })?;
        peripheral.subscribe(&rx_char).await?;

        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(self.config.write_queue_depth);
        let link = self.registry.register(address, frame_tx);

        // writer: drain the frame queue, chunking at the ATT payload size
        let writer = peripheral.clone();
        let chunk_size = self.config.effective_mtu().max(20);
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                for chunk in frame.chunks(chunk_size) {
                    if let Err(e) = writer
                        .write(&tx_char, chunk, WriteType::WithoutResponse)
                        .await
                    {
                        debug!(link, "write failed, dropping connection: {}", e);
                        return;
                    }
                }
            }
        });

        // reader: assemble notify chunks into frames for the mesh loop
        let mut notifications = peripheral.notifications().await?;
        let reader_events = events.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut assembler = FrameAssembler::new();
            while let Some(notification) = notifications.next().await {
                if notification.uuid != BITCHAT_RX_CHARACTERISTIC_UUID {
                    continue;
                }
                match assembler.push(&notification.value) {
                    Ok(frames) => {
                        for frame in frames {
                            if reader_events
                                .send(LinkEvent::FrameReceived { link, frame })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(()) => {
                        warn!(link, "frame assembly overflow, resetting connection buffer");
                    }
                }
            }
            // notification stream ended: the connection is gone
            registry.remove(link);
            let _ = reader_events.send(LinkEvent::Disconnected { link }).await;
        });

        events
            .send(LinkEvent::Connected { link })
            .await
            .map_err(|_| BleLinkError::NotRunning)?;
        Ok(link)
    }
}
