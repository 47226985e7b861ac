//! Link abstraction between the mesh loop and a radio
//!
//! A [`MeshLink`] is one physical neighborhood: it owns connections to
//! directly reachable peers and moves opaque frames. The mesh loop never
//! touches the radio; link implementations (BLE, in-memory test fabric)
//! push [`LinkEvent`]s into the loop and expose frame I/O keyed by an
//! opaque per-connection [`LinkId`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;

/// Opaque identifier for one live connection on a link
pub type LinkId = u64;

// ----------------------------------------------------------------------------
// Link Events
// ----------------------------------------------------------------------------

/// What a link reports into the mesh loop
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A connection came up (peer identity arrives later via Announce)
    Connected { link: LinkId },
    /// A connection went down
    Disconnected { link: LinkId },
    /// One complete frame arrived on a connection
    FrameReceived { link: LinkId, frame: Vec<u8> },
}

// ----------------------------------------------------------------------------
// Mesh Link Trait
// ----------------------------------------------------------------------------

/// Frame transport under the mesh loop
///
/// Implementations deliver inbound frames whole: accumulation of transport
/// chunks into complete frames (via [`crate::protocol::frame_length`])
/// happens inside the link.
#[async_trait]
pub trait MeshLink: Send + Sync {
    /// Largest frame this link carries in one piece
    fn mtu(&self) -> usize;

    /// Register the event channel into the mesh loop; called once before
    /// `start`
    fn attach_events(&self, events: mpsc::Sender<LinkEvent>);

    /// Bring the link up (advertise, scan, accept)
    async fn start(&self) -> Result<()>;

    /// Tear the link down and drop all connections
    async fn stop(&self) -> Result<()>;

    /// Send one frame on a specific connection
    async fn send_frame(&self, link: LinkId, frame: &[u8]) -> Result<()>;

    /// Send one frame on every connection except `exclude`
    async fn broadcast_frame(&self, frame: &[u8], exclude: Option<LinkId>) -> Result<()>;

    /// Currently live connections
    fn connected_links(&self) -> Vec<LinkId>;
}
