//! Bluetooth Low Energy mesh link for BitChat
//!
//! Implements [`bitchat_core::link::MeshLink`] over GATT: the node runs as
//! peripheral (advertising the BitChat service, BlueZ-backed on Linux) and
//! central (btleplug scanning and connecting) at the same time. Outbound
//! frames pass through bounded per-peer write queues; inbound notify chunks
//! are accumulated per connection until the codec can delimit a complete
//! frame.
//!
//! - [`config`]: link tuning (timeouts, queue depth, backoff)
//! - [`protocol`]: service/characteristic UUIDs and stream framing
//! - [`peer`]: per-connection state and reconnect backoff
//! - [`central`]: scanning, connecting, notification plumbing
//! - [`peripheral`]: advertising and the local GATT service
//! - [`link`]: the `MeshLink` glue

pub mod central;
pub mod config;
pub mod error;
pub mod link;
pub mod peer;
pub mod peripheral;
pub mod protocol;

pub use config::BleLinkConfig;
pub use error::BleLinkError;
pub use link::BleLink;
pub use protocol::{BITCHAT_RX_CHARACTERISTIC_UUID, BITCHAT_SERVICE_UUID, BITCHAT_TX_CHARACTERISTIC_UUID};
