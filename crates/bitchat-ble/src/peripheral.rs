//! Peripheral role: advertising and the local GATT service
//!
//! On Linux this registers the BitChat service with BlueZ via `bluer`:
//! remote centrals write frames to our `TX` characteristic and subscribe to
//! `RX` for notifies. BlueZ fans notifies out to every subscriber, so
//! peripheral-side sends are effectively broadcast; the mesh's dedup and
//! recipient filtering absorb the extra copies. Other platforms fall back
//! to central-only operation.
//!
//! Peripheral-side connections get link ids above [`PERIPHERAL_LINK_BASE`]
//! so the link facade can tell both kinds apart.

use tokio::sync::mpsc;

use bitchat_core::link::LinkEvent;

use crate::config::BleLinkConfig;
use crate::error::BleLinkError;

/// Peripheral-side link ids start here; central-side ids count from zero
pub const PERIPHERAL_LINK_BASE: u64 = 1 << 32;

#[cfg(target_os = "linux")]
pub use linux::BlePeripheral;

#[cfg(not(target_os = "linux"))]
pub use fallback::BlePeripheral;

// ----------------------------------------------------------------------------
// Linux (BlueZ via bluer)
// ----------------------------------------------------------------------------

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use bluer::adv::Advertisement;
    use bluer::gatt::local::{
        Application, ApplicationHandle, Characteristic, CharacteristicNotify,
        CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod, ReqError,
        Service,
    };
    use bluer::Address;
    use futures::FutureExt;
    use tracing::{debug, info, warn};

    use crate::protocol::{
        FrameAssembler, BITCHAT_RX_CHARACTERISTIC_UUID, BITCHAT_SERVICE_UUID,
        BITCHAT_TX_CHARACTERISTIC_UUID,
    };

    struct Served {
        _app: ApplicationHandle,
        _adv: bluer::adv::AdvertisementHandle,
    }

    /// BlueZ-backed peripheral: GATT service plus advertising
    pub struct BlePeripheral {
        config: BleLinkConfig,
        served: tokio::sync::Mutex<Option<Served>>,
        notifiers: Arc<tokio::sync::Mutex<Vec<bluer::gatt::local::CharacteristicNotifier>>>,
        /// inbound writers keyed by central address
        writers: Arc<Mutex<HashMap<Address, (u64, FrameAssembler)>>>,
        next_link: Arc<AtomicU64>,
    }

    impl BlePeripheral {
        pub fn new(config: BleLinkConfig) -> Self {
            Self {
                config,
                served: tokio::sync::Mutex::new(None),
                notifiers: Arc::new(tokio::sync::Mutex::new(Vec::new())),
                writers: Arc::new(Mutex::new(HashMap::new())),
                next_link: Arc::new(AtomicU64::new(PERIPHERAL_LINK_BASE)),
            }
        }

        /// Register the GATT application and start advertising
        pub async fn start(
            &self,
            local_name: String,
            events: mpsc::Sender<LinkEvent>,
        ) -> Result<(), BleLinkError> {
            let mut served = self.served.lock().await;
            if served.is_some() {
                return Ok(());
            }

            let session = bluer::Session::new()
                .await
                .map_err(|_| BleLinkError::NoAdapter)?;
            let adapter = session
                .default_adapter()
                .await
                .map_err(|_| BleLinkError::NoAdapter)?;
            if !adapter.is_powered().await.unwrap_or(false) {
                adapter
                    .set_powered(true)
                    .await
                    .map_err(|_| BleLinkError::NoAdapter)?;
            }

            let writers = self.writers.clone();
            let next_link = self.next_link.clone();
            let write_events = events.clone();

            let notifiers = self.notifiers.clone();

            let app = Application {
                services: vec![Service {
                    uuid: BITCHAT_SERVICE_UUID,
                    primary: true,
                    characteristics: vec![
                        Characteristic {
                            uuid: BITCHAT_TX_CHARACTERISTIC_UUID,
                            write: Some(CharacteristicWrite {
                                write: true,
                                write_without_response: true,
                                method: CharacteristicWriteMethod::Fun(Box::new(
                                    move |new_value, req| {
                                        let writers = writers.clone();
                                        let next_link = next_link.clone();
                                        let events = write_events.clone();
                                        async move {
                                            let address = req.device_address;
                                            let (link, frames) = {
                                                let mut writers =
                                                    writers.lock().expect("writer table lock");
                                                let entry = writers
                                                    .entry(address)
                                                    .or_insert_with(|| {
                                                        (
                                                            next_link
                                                                .fetch_add(1, Ordering::SeqCst),
                                                            FrameAssembler::new(),
                                                        )
                                                    });
                                                let frames = entry
                                                    .1
                                                    .push(&new_value)
                                                    .unwrap_or_default();
                                                (entry.0, frames)
                                            };
                                            for frame in frames {
                                                if events
                                                    .send(LinkEvent::FrameReceived {
                                                        link,
                                                        frame,
                                                    })
                                                    .await
                                                    .is_err()
                                                {
                                                    return Err(ReqError::Failed);
                                                }
                                            }
                                            Ok(())
                                        }
                                        .boxed()
                                    },
                                )),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Characteristic {
                            uuid: BITCHAT_RX_CHARACTERISTIC_UUID,
                            notify: Some(CharacteristicNotify {
                                notify: true,
                                method: CharacteristicNotifyMethod::Fun(Box::new(
                                    move |notifier| {
                                        let notifiers = notifiers.clone();
                                        async move {
                                            debug!("central subscribed to RX");
                                            notifiers.lock().await.push(notifier);
                                        }
                                        .boxed()
                                    },
                                )),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            };

            let app_handle = adapter
                .serve_gatt_application(app)
                .await
                .map_err(|e| {
                    warn!("GATT registration failed: {}", e);
                    BleLinkError::AdvertisingUnsupported
                })?;

            let advertisement = Advertisement {
                advertisement_type: bluer::adv::Type::Peripheral,
                local_name: Some(local_name.clone()),
                service_uuids: vec![BITCHAT_SERVICE_UUID].into_iter().collect(),
                discoverable: Some(true),
                ..Default::default()
            };
            let adv_handle = adapter.advertise(advertisement).await.map_err(|e| {
                warn!("advertising failed: {}", e);
                BleLinkError::AdvertisingUnsupported
            })?;

            info!(name = %local_name, "peripheral advertising");
            *served = Some(Served {
                _app: app_handle,
                _adv: adv_handle,
            });
            Ok(())
        }

        /// Drop the GATT registration and advertisement
        pub async fn stop(&self) {
            *self.served.lock().await = None;
            self.notifiers.lock().await.clear();
            self.writers.lock().expect("writer table lock").clear();
        }

        /// Whether `link` belongs to a peripheral-side connection
        pub fn owns_link(&self, link: u64) -> bool {
            link >= PERIPHERAL_LINK_BASE
        }

        /// Notify a frame to every subscribed central, chunked at the ATT
        /// payload size
        pub async fn notify_frame(&self, frame: &[u8]) {
            let chunk_size = self.config.effective_mtu().max(20);
            let mut notifiers = self.notifiers.lock().await;
            let mut dead = Vec::new();
            for (index, notifier) in notifiers.iter_mut().enumerate() {
                let mut failed = false;
                for chunk in frame.chunks(chunk_size) {
                    if notifier.notify(chunk.to_vec()).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    dead.push(index);
                }
            }
            for index in dead.into_iter().rev() {
                notifiers.swap_remove(index);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Fallback (central-only platforms)
// ----------------------------------------------------------------------------

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::*;
    use tracing::warn;

    /// No peripheral support off Linux; the node still participates as a
    /// central
    pub struct BlePeripheral {
        _config: BleLinkConfig,
    }

    impl BlePeripheral {
        pub fn new(config: BleLinkConfig) -> Self {
            Self { _config: config }
        }

        pub async fn start(
            &self,
            _local_name: String,
            _events: mpsc::Sender<LinkEvent>,
        ) -> Result<(), BleLinkError> {
            warn!("BLE advertising unsupported on this platform, central-only");
            Ok(())
        }

        pub async fn stop(&self) {}

        pub fn owns_link(&self, link: u64) -> bool {
            link >= PERIPHERAL_LINK_BASE
        }

        pub async fn notify_frame(&self, _frame: &[u8]) {}
    }
}
