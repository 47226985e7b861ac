//! `MeshLink` implementation gluing central and peripheral roles

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use bitchat_core::errors::Result;
use bitchat_core::link::{LinkEvent, LinkId, MeshLink};
use bitchat_core::PeerId;

use crate::central::{BleCentral, ConnectionRegistry};
use crate::config::BleLinkConfig;
use crate::error::BleLinkError;
use crate::peripheral::BlePeripheral;
use crate::protocol::device_name;

/// Dual-role BLE link under the mesh loop
pub struct BleLink {
    config: BleLinkConfig,
    local_peer_id: PeerId,
    registry: Arc<ConnectionRegistry>,
    peripheral: BlePeripheral,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl BleLink {
    pub fn new(config: BleLinkConfig, local_peer_id: PeerId) -> Self {
        Self {
            peripheral: BlePeripheral::new(config.clone()),
            config,
            local_peer_id,
            registry: Arc::new(ConnectionRegistry::new()),
            events: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    fn events_sender(&self) -> Result<mpsc::Sender<LinkEvent>> {
        self.events
            .lock()
            .expect("events lock")
            .clone()
            .ok_or_else(|| BleLinkError::NotRunning.into())
    }
}

#[async_trait]
impl MeshLink for BleLink {
    fn mtu(&self) -> usize {
        self.config.max_frame_len
    }

    fn attach_events(&self, events: mpsc::Sender<LinkEvent>) {
        *self.events.lock().expect("events lock") = Some(events);
    }

    async fn start(&self) -> Result<()> {
        {
            let shutdown = self.shutdown.lock().expect("shutdown lock");
            if shutdown.is_some() {
                return Ok(());
            }
        }
        let events = self.events_sender()?;

        // peripheral side: GATT service + advertising (where supported)
        let name = device_name(&self.local_peer_id, &self.config.device_name_prefix);
        if let Err(e) = self.peripheral.start(name, events.clone()).await {
            warn!("peripheral start failed, continuing central-only: {}", e);
        }

        // central side: scan + connect on the first adapter
        let manager = Manager::new().await.map_err(BleLinkError::from)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(BleLinkError::from)?
            .into_iter()
            .next()
            .ok_or(BleLinkError::NoAdapter)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().expect("shutdown lock") = Some(shutdown_tx);

        let central = BleCentral::new(self.config.clone(), self.registry.clone());
        tokio::spawn(async move {
            if let Err(e) = central.run(adapter, events, shutdown_rx).await {
                warn!("central loop ended with error: {}", e);
            }
        });

        info!(peer = %self.local_peer_id, "BLE link started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let shutdown = self.shutdown.lock().expect("shutdown lock").take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        self.peripheral.stop().await;
        info!("BLE link stopped");
        Ok(())
    }

    async fn send_frame(&self, link: LinkId, frame: &[u8]) -> Result<()> {
        if self.peripheral.owns_link(link) {
            // BlueZ notifies reach every subscriber; dedup upstream absorbs
            // the extra copies
            self.peripheral.notify_frame(frame).await;
            return Ok(());
        }
        self.registry.send(link, frame).map_err(Into::into)
    }

    async fn broadcast_frame(&self, frame: &[u8], exclude: Option<LinkId>) -> Result<()> {
        self.registry.broadcast(frame, exclude);
        if exclude.map_or(true, |link| !self.peripheral.owns_link(link)) {
            self.peripheral.notify_frame(frame).await;
        }
        Ok(())
    }

    fn connected_links(&self) -> Vec<LinkId> {
        self.registry.links()
    }
}
