//! Mesh transport
//!
//! Composes the codec, fragmentation, dedup/TTL flood routing, and Noise
//! sessions over a [`MeshLink`], and exposes the peer lifecycle and message
//! I/O the router and application consume.
//!
//! All mutable mesh state (sessions, dedup cache, reassembly buffers,
//! pending sends, peer table) is owned by a single loop task; the cloneable
//! [`MeshTransport`] handle posts commands into it. Link callbacks and
//! timers never touch state directly.

pub mod dedup;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::errors::Result;
use crate::event::{AppEvent, EventEmitter};
use crate::files::PendingFileManager;
use crate::identity::{generate_fingerprint, FavoritesRegistry, IdentityStore, LocalIdentity};
use crate::link::{LinkEvent, LinkId, MeshLink};
use crate::noise::session::{local_wins_initiator_race, HandshakeRole, NoiseSession, SessionState};
use crate::pipeline::{PublicMessage, PublicPipeline};
use crate::protocol::payloads::{
    AnnouncePayload, DeliveryAckPayload, FavoritePayload, FileTransferPayload,
    PrivateMessagePayload, PublicMessagePayload, ReadReceiptPayload,
};
use crate::protocol::wire::{BitchatPacket, MessageType};
use crate::protocol::{Fragmenter, Reassembler};
use crate::transport::{Transport, TransportKind};
use crate::types::{Fingerprint, PeerId, TimeSource, Timestamp};

use dedup::DedupCache;

/// A peer counts as recently-seen for this long after its last packet
const REACHABLE_WINDOW_MS: u64 = 30_000;

/// Pending file expiration cadence
const FILE_EXPIRE_INTERVAL_MS: u64 = 30_000;

// ----------------------------------------------------------------------------
// Peer Table
// ----------------------------------------------------------------------------

/// What the mesh knows about a peer
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub nickname: Option<String>,
    pub link: Option<LinkId>,
    pub last_seen: Timestamp,
    pub fingerprint: Option<Fingerprint>,
    pub noise_static_key: Option<[u8; 32]>,
    pub session_established: bool,
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

enum MeshCommand {
    Start,
    Stop,
    EmergencyDisconnect,
    PanicClear,
    SendPublic {
        content: String,
        message_id: String,
    },
    SendPrivate {
        to: PeerId,
        content: String,
        message_id: String,
    },
    SendFile {
        to: Option<PeerId>,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
    },
    SendReadReceipt {
        to: PeerId,
        message_id: String,
    },
    SendDeliveryAck {
        to: PeerId,
        message_id: String,
    },
    SendFavorite {
        to: PeerId,
        is_favorite: bool,
    },
    SetNickname(String),
    Block(Fingerprint),
    SetFavorite {
        fingerprint: Fingerprint,
        is_favorite: bool,
    },
}

// ----------------------------------------------------------------------------
// Shared State (read-mostly, written only by the loop)
// ----------------------------------------------------------------------------

struct MeshShared {
    my_peer_id: PeerId,
    nickname: RwLock<String>,
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    favorites: Arc<RwLock<FavoritesRegistry>>,
    pipeline: Arc<Mutex<PublicPipeline>>,
    files: Arc<PendingFileManager>,
    running: AtomicBool,
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable handle onto the mesh loop
#[derive(Clone)]
pub struct MeshTransport {
    commands: mpsc::Sender<MeshCommand>,
    shared: Arc<MeshShared>,
    time: Arc<dyn TimeSource>,
}

impl MeshTransport {
    /// Construct the mesh and spawn its loop task. The transport is idle
    /// until [`MeshTransport::start`] is called.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MeshConfig,
        identity: LocalIdentity,
        nickname: String,
        link: Arc<dyn MeshLink>,
        favorites: Arc<RwLock<FavoritesRegistry>>,
        pipeline: Arc<Mutex<PublicPipeline>>,
        files: Arc<PendingFileManager>,
        identity_store: Option<Arc<dyn IdentityStore>>,
        time: Arc<dyn TimeSource>,
        events: EventEmitter,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (link_tx, link_rx) = mpsc::channel(256);
        link.attach_events(link_tx);

        let shared = Arc::new(MeshShared {
            my_peer_id: identity.peer_id(),
            nickname: RwLock::new(nickname),
            peers: RwLock::new(HashMap::new()),
            favorites,
            pipeline,
            files,
            running: AtomicBool::new(false),
        });

        let mesh_loop = MeshLoop {
            dedup: DedupCache::new(&config.dedup),
            reassembler: Reassembler::new(config.fragmentation.reassembly_timeout),
            config,
            identity,
            shared: shared.clone(),
            link,
            time: time.clone(),
            events,
            sessions: HashMap::new(),
            pending_private: HashMap::new(),
            links_to_peers: HashMap::new(),
            identity_store,
            last_file_expiry: Timestamp::default(),
        };
        tokio::spawn(mesh_loop.run(command_rx, link_rx));

        Self {
            commands: command_tx,
            shared,
            time,
        }
    }

    /// Bring the link up; idempotent
    pub async fn start(&self) -> Result<()> {
        self.send(MeshCommand::Start).await
    }

    /// Tear the link down, keeping state; idempotent
    pub async fn stop(&self) -> Result<()> {
        self.send(MeshCommand::Stop).await
    }

    /// Drop every connection and session immediately
    pub async fn emergency_disconnect(&self) -> Result<()> {
        self.send(MeshCommand::EmergencyDisconnect).await
    }

    /// Wipe key material, queues, and pending files synchronously with
    /// respect to the mesh loop
    pub async fn panic_clear_all_data(&self) -> Result<()> {
        self.send(MeshCommand::PanicClear).await
    }

    pub fn my_peer_id(&self) -> PeerId {
        self.shared.my_peer_id
    }

    pub fn my_nickname(&self) -> String {
        self.shared.nickname.read().expect("nickname lock").clone()
    }

    pub async fn set_nickname(&self, nickname: String) -> Result<()> {
        self.send(MeshCommand::SetNickname(nickname)).await
    }

    /// Whether a live link currently reaches the peer
    pub fn is_peer_connected(&self, peer: PeerId) -> bool {
        self.shared
            .peers
            .read()
            .expect("peer table lock")
            .get(&peer)
            .map(|info| info.link.is_some())
            .unwrap_or(false)
    }

    /// Connected, or heard from within the reachability window
    pub fn is_peer_reachable_now(&self, peer: PeerId) -> bool {
        let peers = self.shared.peers.read().expect("peer table lock");
        match peers.get(&peer) {
            Some(info) => {
                info.link.is_some()
                    || self.time.now().millis_since(info.last_seen) <= REACHABLE_WINDOW_MS
            }
            None => false,
        }
    }

    /// Broadcast an unsigned public message
    pub async fn send_public_message(&self, content: &str, message_id: &str) -> Result<()> {
        self.send(MeshCommand::SendPublic {
            content: content.to_string(),
            message_id: message_id.to_string(),
        })
        .await
    }

    /// Send a file, directed or broadcast, fragmenting as needed
    pub async fn send_file_transfer(
        &self,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
        to: Option<PeerId>,
    ) -> Result<()> {
        self.send(MeshCommand::SendFile {
            to,
            file_name,
            mime_type,
            content,
        })
        .await
    }

    /// Block a fingerprint at mesh ingress
    pub async fn block(&self, fingerprint: Fingerprint) -> Result<()> {
        self.send(MeshCommand::Block(fingerprint)).await
    }

    /// Toggle a favorite flag locally
    pub async fn set_favorite(&self, fingerprint: Fingerprint, is_favorite: bool) -> Result<()> {
        self.send(MeshCommand::SetFavorite {
            fingerprint,
            is_favorite,
        })
        .await
    }

    /// Snapshot of the public timeline
    pub fn timeline(&self) -> Vec<PublicMessage> {
        self.shared
            .pipeline
            .lock()
            .expect("pipeline lock")
            .timeline()
            .to_vec()
    }

    /// Snapshot of the peer table
    pub fn peers(&self) -> HashMap<PeerId, PeerInfo> {
        self.shared.peers.read().expect("peer table lock").clone()
    }

    async fn send(&self, command: MeshCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| crate::BitchatError::ChannelClosed("mesh loop gone".into()))
    }
}

#[async_trait]
impl Transport for MeshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mesh
    }

    fn is_peer_reachable(&self, peer: PeerId) -> bool {
        self.is_peer_reachable_now(peer)
    }

    async fn send_private_message(
        &self,
        content: &str,
        to: PeerId,
        _recipient_nickname: &str,
        message_id: &str,
    ) -> Result<()> {
        self.send(MeshCommand::SendPrivate {
            to,
            content: content.to_string(),
            message_id: message_id.to_string(),
        })
        .await
    }

    async fn send_read_receipt(&self, to: PeerId, message_id: &str) -> Result<()> {
        self.send(MeshCommand::SendReadReceipt {
            to,
            message_id: message_id.to_string(),
        })
        .await
    }

    async fn send_delivery_ack(&self, to: PeerId, message_id: &str) -> Result<()> {
        self.send(MeshCommand::SendDeliveryAck {
            to,
            message_id: message_id.to_string(),
        })
        .await
    }

    async fn send_favorite_notification(&self, to: PeerId, is_favorite: bool) -> Result<()> {
        self.send(MeshCommand::SendFavorite { to, is_favorite }).await
    }
}

// ----------------------------------------------------------------------------
// Loop
// ----------------------------------------------------------------------------

/// A plaintext waiting for its session
struct QueuedPlain {
    inner_type: MessageType,
    payload: Vec<u8>,
    message_id: Option<String>,
    deadline: Timestamp,
}

struct MeshLoop {
    config: MeshConfig,
    identity: LocalIdentity,
    shared: Arc<MeshShared>,
    link: Arc<dyn MeshLink>,
    time: Arc<dyn TimeSource>,
    events: EventEmitter,
    sessions: HashMap<PeerId, NoiseSession>,
    dedup: DedupCache,
    reassembler: Reassembler,
    pending_private: HashMap<PeerId, Vec<QueuedPlain>>,
    links_to_peers: HashMap<LinkId, PeerId>,
    identity_store: Option<Arc<dyn IdentityStore>>,
    last_file_expiry: Timestamp,
}

impl MeshLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<MeshCommand>,
        mut link_events: mpsc::Receiver<LinkEvent>,
    ) {
        let mut announce = tokio::time::interval(self.config.announce_interval);
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        announce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = link_events.recv() => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => break,
                },
                _ = announce.tick() => {
                    if self.running() {
                        self.send_announce().await;
                    }
                }
                _ = maintenance.tick() => self.maintenance().await,
            }
        }
        debug!("mesh loop terminated");
    }

    fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn now(&self) -> Timestamp {
        self.time.now()
    }

    fn my_peer_id(&self) -> PeerId {
        self.shared.my_peer_id
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Returns true when the loop should exit
    async fn handle_command(&mut self, command: MeshCommand) -> bool {
        match command {
            MeshCommand::Start => {
                if !self.shared.running.swap(true, Ordering::SeqCst) {
                    if let Err(e) = self.link.start().await {
                        warn!("link start failed: {}", e);
                        self.shared.running.store(false, Ordering::SeqCst);
                    } else {
                        info!(peer = %self.my_peer_id(), "mesh started");
                        self.send_announce().await;
                    }
                }
            }
            MeshCommand::Stop => {
                if self.shared.running.swap(false, Ordering::SeqCst) {
                    let _ = self.link.stop().await;
                    self.disconnect_all();
                    info!("mesh stopped");
                }
            }
            MeshCommand::EmergencyDisconnect => {
                self.shared.running.store(false, Ordering::SeqCst);
                let _ = self.link.stop().await;
                self.disconnect_all();
                info!("emergency disconnect complete");
            }
            MeshCommand::PanicClear => self.panic_clear(),
            MeshCommand::SendPublic {
                content,
                message_id,
            } => self.send_public(&content, &message_id).await,
            MeshCommand::SendPrivate {
                to,
                content,
                message_id,
            } => self.send_private(to, &content, &message_id).await,
            MeshCommand::SendFile {
                to,
                file_name,
                mime_type,
                content,
            } => self.send_file(to, file_name, mime_type, content).await,
            MeshCommand::SendReadReceipt { to, message_id } => {
                let payload = ReadReceiptPayload { message_id }.encode();
                if let Ok(payload) = payload {
                    self.send_to_peer(to, MessageType::ReadReceipt, payload).await;
                }
            }
            MeshCommand::SendDeliveryAck { to, message_id } => {
                let payload = DeliveryAckPayload { message_id }.encode();
                if let Ok(payload) = payload {
                    self.send_to_peer(to, MessageType::DeliveryAck, payload).await;
                }
            }
            MeshCommand::SendFavorite { to, is_favorite } => {
                let payload = FavoritePayload {
                    is_favorite,
                    nostr_pubkey: None,
                }
                .encode();
                if let Ok(payload) = payload {
                    self.send_to_peer(to, MessageType::Favorite, payload).await;
                }
            }
            MeshCommand::SetNickname(nickname) => {
                *self.shared.nickname.write().expect("nickname lock") = nickname;
                if self.running() {
                    self.send_announce().await;
                }
            }
            MeshCommand::Block(fingerprint) => {
                self.shared
                    .favorites
                    .write()
                    .expect("favorites lock")
                    .block(fingerprint);
            }
            MeshCommand::SetFavorite {
                fingerprint,
                is_favorite,
            } => {
                let peer = self
                    .shared
                    .favorites
                    .write()
                    .expect("favorites lock")
                    .set_favorite(fingerprint, is_favorite);
                if let Some(peer_id) = peer {
                    self.events.emit(AppEvent::FavoriteStatusChanged {
                        peer_id,
                        is_favorite,
                    });
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------------
    // Link Events
    // ------------------------------------------------------------------------

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { link } => {
                debug!(link, "link up, announcing");
                self.send_announce().await;
            }
            LinkEvent::Disconnected { link } => {
                if let Some(peer_id) = self.links_to_peers.remove(&link) {
                    let mut peers = self.shared.peers.write().expect("peer table lock");
                    if let Some(info) = peers.get_mut(&peer_id) {
                        info.link = None;
                    }
                    drop(peers);
                    self.events.emit(AppEvent::PeerDisconnected { peer_id });
                }
            }
            LinkEvent::FrameReceived { link, frame } => {
                match BitchatPacket::decode(&frame) {
                    Ok(packet) => self.handle_packet(packet, Some(link)).await,
                    Err(e) => debug!(link, "undecodable frame dropped: {}", e),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound Routing (dedup + TTL flood)
    // ------------------------------------------------------------------------

    async fn handle_packet(&mut self, packet: BitchatPacket, via: Option<LinkId>) {
        let now = self.now();

        // loopback suppression
        if packet.sender_id == self.my_peer_id() {
            return;
        }

        if self.dedup.check_and_record(&packet, now) {
            debug!(sender = %packet.sender_id, "duplicate packet dropped");
            return;
        }

        if self
            .shared
            .favorites
            .read()
            .expect("favorites lock")
            .is_peer_blocked(packet.sender_id)
        {
            debug!(sender = %packet.sender_id, "packet from blocked peer dropped");
            return;
        }

        self.touch_peer(packet.sender_id, via, now);

        let me = self.my_peer_id();
        if packet.is_broadcast() || packet.is_for(me) {
            self.handle_local(&packet, via).await;
        }

        // flood forward: never packets addressed to us, never ttl <= 1
        if !packet.is_for(me) && packet.ttl.value() > 1 {
            if let Some(ttl) = packet.ttl.decrement() {
                let mut forward = packet;
                forward.ttl = ttl;
                match forward.encode(true) {
                    Ok(frame) => {
                        if let Err(e) = self.link.broadcast_frame(&frame, via).await {
                            debug!("forward failed: {}", e);
                        }
                    }
                    Err(e) => warn!("re-encode for forward failed: {}", e),
                }
            }
        }
    }

    fn handle_local<'a>(
        &'a mut self,
        packet: &'a BitchatPacket,
        via: Option<LinkId>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        match packet.message_type {
            MessageType::Fragment => self.handle_fragment(packet, via).await,
            MessageType::Announce => self.handle_announce(packet, via),
            MessageType::Message => self.handle_public_message(packet),
            MessageType::Leave => self.handle_leave(packet.sender_id),
            MessageType::NoiseHandshakeInit => {
                self.handle_handshake_init(packet.sender_id, &packet.payload).await
            }
            MessageType::NoiseHandshakeResp => {
                self.handle_handshake_resp(packet.sender_id, &packet.payload).await
            }
            MessageType::NoiseTransport => {
                self.handle_noise_transport(packet.sender_id, &packet.payload).await
            }
            MessageType::FileTransfer => self.handle_file_transfer(packet.sender_id, &packet.payload, false),
            MessageType::DeliveryAck => {
                if let Ok(ack) = DeliveryAckPayload::decode(&packet.payload) {
                    self.events.emit(AppEvent::DeliveryAckReceived {
                        peer_id: packet.sender_id,
                        message_id: ack.message_id,
                    });
                }
            }
            MessageType::ReadReceipt => {
                if let Ok(receipt) = ReadReceiptPayload::decode(&packet.payload) {
                    self.events.emit(AppEvent::ReadReceiptReceived {
                        peer_id: packet.sender_id,
                        message_id: receipt.message_id,
                    });
                }
            }
            MessageType::Favorite => self.handle_favorite(packet.sender_id, &packet.payload),
            MessageType::PrivateMessage => {
                // private text is only valid inside a Noise envelope
                warn!(sender = %packet.sender_id, "plaintext private message dropped");
            }
        }
        })
    }

    async fn handle_fragment(&mut self, packet: &BitchatPacket, via: Option<LinkId>) {
        let now = self.now();
        match self
            .reassembler
            .add_fragment(packet.sender_id, &packet.payload, now)
        {
            Ok(Some(bytes)) => match BitchatPacket::decode(&bytes) {
                Ok(inner) if inner.sender_id == packet.sender_id => {
                    // the reassembled packet takes the normal local path once;
                    // forwarding happened fragment by fragment
                    self.dedup.check_and_record(&inner, now);
                    self.handle_local(&inner, via).await;
                }
                Ok(_) => warn!(sender = %packet.sender_id, "reassembled sender mismatch, dropped"),
                Err(e) => debug!("reassembled packet undecodable: {}", e),
            },
            Ok(None) => {}
            Err(e) => debug!(sender = %packet.sender_id, "fragment dropped: {}", e),
        }
    }

    fn handle_announce(&mut self, packet: &BitchatPacket, via: Option<LinkId>) {
        let Ok(announce) = AnnouncePayload::decode(&packet.payload) else {
            debug!(sender = %packet.sender_id, "malformed announce dropped");
            return;
        };
        if packet.verify_signature(&announce.identity_key).is_err() {
            warn!(sender = %packet.sender_id, "announce signature invalid, dropped");
            return;
        }
        let fingerprint = generate_fingerprint(announce.noise_static_key);
        if fingerprint.to_peer_id() != packet.sender_id {
            warn!(sender = %packet.sender_id, "announce key does not match sender id, dropped");
            return;
        }

        {
            let mut favorites = self.shared.favorites.write().expect("favorites lock");
            favorites.note_peer(packet.sender_id, fingerprint, &announce.nickname);
            if favorites.is_blocked(&fingerprint) {
                return;
            }
        }

        // full TTL means the announce arrived without a relay hop, so `via`
        // really is a direct link to this peer
        let direct = packet.ttl == crate::types::Ttl::MAX && via.is_some();
        let first_contact;
        {
            let mut peers = self.shared.peers.write().expect("peer table lock");
            let info = peers.entry(packet.sender_id).or_default();
            first_contact = info.link.is_none() && direct;
            if direct {
                info.link = via;
            }
            info.nickname = Some(announce.nickname.clone());
            info.fingerprint = Some(fingerprint);
            info.noise_static_key = Some(announce.noise_static_key);
            info.last_seen = self.now();
        }
        if direct {
            if let Some(link) = via {
                self.links_to_peers.insert(link, packet.sender_id);
            }
        }
        if first_contact {
            info!(peer = %packet.sender_id, nickname = %announce.nickname, "peer connected");
            self.events.emit(AppEvent::PeerConnected {
                peer_id: packet.sender_id,
                nickname: Some(announce.nickname),
            });
        }
    }

    fn handle_public_message(&mut self, packet: &BitchatPacket) {
        let Ok(message) = PublicMessagePayload::decode(&packet.payload) else {
            debug!(sender = %packet.sender_id, "malformed public message dropped");
            return;
        };
        let nickname = self
            .shared
            .peers
            .read()
            .expect("peer table lock")
            .get(&packet.sender_id)
            .and_then(|info| info.nickname.clone());
        self.shared
            .pipeline
            .lock()
            .expect("pipeline lock")
            .enqueue(
                PublicMessage {
                    id: message.message_id,
                    sender: packet.sender_id,
                    nickname,
                    content: message.content,
                    timestamp: packet.timestamp,
                },
                self.now(),
            );
    }

    fn handle_leave(&mut self, peer_id: PeerId) {
        if let Some(mut session) = self.sessions.remove(&peer_id) {
            session.fail();
            self.events.emit(AppEvent::SessionLost { peer_id });
        }
        let mut peers = self.shared.peers.write().expect("peer table lock");
        if let Some(info) = peers.get_mut(&peer_id) {
            if let Some(link) = info.link.take() {
                self.links_to_peers.remove(&link);
            }
            info.session_established = false;
        }
        drop(peers);
        self.events.emit(AppEvent::PeerDisconnected { peer_id });
    }

    fn handle_favorite(&mut self, peer_id: PeerId, payload: &[u8]) {
        let Ok(favorite) = FavoritePayload::decode(payload) else {
            return;
        };
        let fingerprint = self
            .shared
            .favorites
            .read()
            .expect("favorites lock")
            .fingerprint_for(peer_id);
        if let Some(fingerprint) = fingerprint {
            self.shared
                .favorites
                .write()
                .expect("favorites lock")
                .set_nostr_pubkey(fingerprint, favorite.nostr_pubkey);
        }
        self.events.emit(AppEvent::FavoriteStatusChanged {
            peer_id,
            is_favorite: favorite.is_favorite,
        });
    }

    fn handle_file_transfer(&mut self, peer_id: PeerId, payload: &[u8], is_private: bool) {
        let Ok(file) = FileTransferPayload::decode(payload) else {
            debug!(sender = %peer_id, "malformed file transfer dropped");
            return;
        };
        let nickname = self
            .shared
            .peers
            .read()
            .expect("peer table lock")
            .get(&peer_id)
            .and_then(|info| info.nickname.clone())
            .unwrap_or_else(|| peer_id.to_string());
        self.shared.files.add(
            peer_id,
            &nickname,
            file.file_name,
            file.mime_type,
            file.content,
            is_private,
        );
    }

    // ------------------------------------------------------------------------
    // Noise
    // ------------------------------------------------------------------------

    async fn handle_handshake_init(&mut self, peer_id: PeerId, payload: &[u8]) {
        let now = self.now();

        // one in-flight handshake per peer; racing initiators tie-break on
        // the announced static keys
        let existing = self
            .sessions
            .get(&peer_id)
            .map(|session| (session.state(), session.role()));
        if let Some((state, role)) = existing {
            if state == SessionState::Handshaking && role == HandshakeRole::Initiator {
                let remote_static = self
                    .shared
                    .peers
                    .read()
                    .expect("peer table lock")
                    .get(&peer_id)
                    .and_then(|info| info.noise_static_key);
                let local_static = self.identity.noise.public_key_bytes();
                let local_wins = remote_static
                    .map(|remote| local_wins_initiator_race(&local_static, &remote))
                    .unwrap_or(self.my_peer_id() > peer_id);
                if local_wins {
                    debug!(peer = %peer_id, "handshake race: staying initiator");
                    return;
                }
                debug!(peer = %peer_id, "handshake race: yielding to remote initiator");
            }
            // duplicate init, restart, or stale session: start over as responder
            self.sessions.remove(&peer_id);
        }

        let mut session = match NoiseSession::new_responder(
            peer_id,
            &self.identity.noise,
            &self.config.session,
            now,
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %peer_id, "responder setup failed: {}", e);
                return;
            }
        };

        match session.read_handshake(payload, now) {
            Ok(Some(reply)) => {
                self.sessions.insert(peer_id, session);
                self.send_handshake_resp(peer_id, reply).await;
            }
            Ok(None) => {
                self.sessions.insert(peer_id, session);
            }
            Err(e) => {
                warn!(peer = %peer_id, "handshake init rejected: {}", e);
            }
        }
    }

    async fn handle_handshake_resp(&mut self, peer_id: PeerId, payload: &[u8]) {
        let now = self.now();
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            debug!(peer = %peer_id, "handshake response without session, dropped");
            return;
        };

        match session.read_handshake(payload, now) {
            Ok(reply) => {
                if let Some(reply) = reply {
                    self.send_handshake_resp(peer_id, reply).await;
                }
                if self
                    .sessions
                    .get(&peer_id)
                    .map(|s| s.is_established())
                    .unwrap_or(false)
                {
                    self.on_session_established(peer_id).await;
                }
            }
            Err(e) => {
                warn!(peer = %peer_id, "handshake failed: {}", e);
                self.kill_session(peer_id);
            }
        }
    }

    async fn on_session_established(&mut self, peer_id: PeerId) {
        let fingerprint = self
            .sessions
            .get(&peer_id)
            .and_then(|session| session.remote_fingerprint());
        if let Some(fingerprint) = fingerprint {
            let mut peers = self.shared.peers.write().expect("peer table lock");
            let info = peers.entry(peer_id).or_default();
            info.fingerprint = Some(fingerprint);
            info.session_established = true;
            drop(peers);
            info!(peer = %peer_id, "session established");
            self.events.emit(AppEvent::SessionEstablished {
                peer_id,
                fingerprint,
            });
        }

        // drain the plaintext queue through the fresh session
        let now = self.now();
        let queued = self.pending_private.remove(&peer_id).unwrap_or_default();
        for item in queued {
            if now > item.deadline {
                if let Some(message_id) = item.message_id {
                    self.events.emit(AppEvent::MessageUnreachable {
                        peer_id,
                        message_id,
                    });
                }
                continue;
            }
            self.send_secure(peer_id, item.inner_type, &item.payload).await;
        }
    }

    async fn handle_noise_transport(&mut self, peer_id: PeerId, payload: &[u8]) {
        let now = self.now();
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            debug!(peer = %peer_id, "transport frame without session, dropped");
            return;
        };

        match session.open(payload, now) {
            Ok(messages) => {
                for plaintext in messages {
                    self.handle_secure_plaintext(peer_id, &plaintext);
                }
            }
            Err(e) => {
                let dead = self
                    .sessions
                    .get(&peer_id)
                    .map(|s| s.state() == SessionState::Dead)
                    .unwrap_or(false);
                if dead {
                    warn!(peer = %peer_id, "session lost: {}", e);
                    self.kill_session(peer_id);
                } else {
                    debug!(peer = %peer_id, "transport frame rejected: {}", e);
                }
            }
        }
    }

    /// Inner secure framing: `inner_type(1) | payload`
    fn handle_secure_plaintext(&mut self, peer_id: PeerId, plaintext: &[u8]) {
        let Some((&type_byte, body)) = plaintext.split_first() else {
            return;
        };
        let Ok(inner_type) = MessageType::from_u8(type_byte) else {
            debug!(peer = %peer_id, "unknown inner type 0x{:02x}", type_byte);
            return;
        };
        match inner_type {
            MessageType::PrivateMessage => {
                if let Ok(message) = PrivateMessagePayload::decode(body) {
                    self.events.emit(AppEvent::PrivateMessageReceived {
                        peer_id,
                        message_id: message.message_id,
                        content: message.content,
                        timestamp: self.now(),
                    });
                }
            }
            MessageType::DeliveryAck => {
                if let Ok(ack) = DeliveryAckPayload::decode(body) {
                    self.events.emit(AppEvent::DeliveryAckReceived {
                        peer_id,
                        message_id: ack.message_id,
                    });
                }
            }
            MessageType::ReadReceipt => {
                if let Ok(receipt) = ReadReceiptPayload::decode(body) {
                    self.events.emit(AppEvent::ReadReceiptReceived {
                        peer_id,
                        message_id: receipt.message_id,
                    });
                }
            }
            MessageType::FileTransfer => self.handle_file_transfer(peer_id, body, true),
            MessageType::Favorite => self.handle_favorite(peer_id, body),
            other => debug!(peer = %peer_id, "unexpected inner type {:?}", other),
        }
    }

    fn kill_session(&mut self, peer_id: PeerId) {
        if let Some(mut session) = self.sessions.remove(&peer_id) {
            session.fail();
        }
        let mut peers = self.shared.peers.write().expect("peer table lock");
        if let Some(info) = peers.get_mut(&peer_id) {
            info.session_established = false;
        }
        drop(peers);
        self.events.emit(AppEvent::SessionLost { peer_id });
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    async fn send_public(&mut self, content: &str, message_id: &str) {
        let payload = PublicMessagePayload {
            message_id: message_id.to_string(),
            content: content.to_string(),
        };
        match payload.encode() {
            Ok(payload) => {
                let packet = BitchatPacket::new(
                    MessageType::Message,
                    self.my_peer_id(),
                    self.now(),
                    payload,
                );
                self.send_packet(packet).await;
            }
            Err(e) => warn!("public message encode failed: {}", e),
        }
    }

    async fn send_private(&mut self, to: PeerId, content: &str, message_id: &str) {
        if self
            .shared
            .favorites
            .read()
            .expect("favorites lock")
            .is_peer_blocked(to)
        {
            warn!(peer = %to, "refusing private send to blocked peer");
            return;
        }
        let payload = PrivateMessagePayload {
            message_id: message_id.to_string(),
            content: content.to_string(),
        };
        let Ok(payload) = payload.encode() else {
            return;
        };

        let established = self
            .sessions
            .get(&to)
            .map(|s| s.is_established())
            .unwrap_or(false);
        if established {
            self.send_secure(to, MessageType::PrivateMessage, &payload).await;
            return;
        }

        // queue the plaintext until the session comes up
        let deadline = self
            .now()
            .plus_millis(self.config.private_send_ttl.as_millis() as u64);
        self.pending_private.entry(to).or_default().push(QueuedPlain {
            inner_type: MessageType::PrivateMessage,
            payload,
            message_id: Some(message_id.to_string()),
            deadline,
        });
        self.ensure_handshake(to).await;
    }

    async fn send_file(
        &mut self,
        to: Option<PeerId>,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
    ) {
        let payload = FileTransferPayload {
            file_name,
            mime_type,
            content,
        };
        let Ok(payload) = payload.encode() else {
            return;
        };
        match to {
            Some(peer_id) => {
                self.send_to_peer(peer_id, MessageType::FileTransfer, payload).await
            }
            None => {
                let packet = BitchatPacket::new(
                    MessageType::FileTransfer,
                    self.my_peer_id(),
                    self.now(),
                    payload,
                );
                self.send_packet(packet).await;
            }
        }
    }

    /// Send through the session when one is up, otherwise as a directed
    /// plaintext packet (handshake-free kinds)
    async fn send_to_peer(&mut self, to: PeerId, inner_type: MessageType, payload: Vec<u8>) {
        let established = self
            .sessions
            .get(&to)
            .map(|s| s.is_established())
            .unwrap_or(false);
        if established {
            self.send_secure(to, inner_type, &payload).await;
            return;
        }
        let packet = BitchatPacket::new(inner_type, self.my_peer_id(), self.now(), payload)
            .with_recipient(to);
        self.send_packet(packet).await;
    }

    async fn send_secure(&mut self, to: PeerId, inner_type: MessageType, payload: &[u8]) {
        let now = self.now();
        let Some(session) = self.sessions.get_mut(&to) else {
            return;
        };
        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(inner_type.as_u8());
        plaintext.extend_from_slice(payload);

        match session.seal(&plaintext, now) {
            Ok(frame) => {
                let packet =
                    BitchatPacket::new(MessageType::NoiseTransport, self.my_peer_id(), now, frame)
                        .with_recipient(to);
                self.send_packet(packet).await;
            }
            Err(e) => {
                warn!(peer = %to, "seal failed: {}", e);
                self.kill_session(to);
            }
        }
    }

    async fn send_handshake_resp(&mut self, to: PeerId, message: Vec<u8>) {
        let packet = BitchatPacket::new(
            MessageType::NoiseHandshakeResp,
            self.my_peer_id(),
            self.now(),
            message,
        )
        .with_recipient(to);
        self.send_packet(packet).await;
    }

    async fn ensure_handshake(&mut self, peer_id: PeerId) {
        let now = self.now();
        let needs_new = match self.sessions.get(&peer_id) {
            Some(session) => session.state() == SessionState::Dead,
            None => true,
        };
        if !needs_new {
            return;
        }

        let mut session = match NoiseSession::new_initiator(
            peer_id,
            &self.identity.noise,
            &self.config.session,
            now,
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!(peer = %peer_id, "initiator setup failed: {}", e);
                return;
            }
        };
        match session.first_message(now) {
            Ok(message) => {
                self.sessions.insert(peer_id, session);
                let packet = BitchatPacket::new(
                    MessageType::NoiseHandshakeInit,
                    self.my_peer_id(),
                    now,
                    message,
                )
                .with_recipient(peer_id);
                self.send_packet(packet).await;
            }
            Err(e) => warn!(peer = %peer_id, "handshake start failed: {}", e),
        }
    }

    /// Encode, pad, fragment over the MTU, and hand frames to the link.
    /// Directed packets prefer the recipient's own link when we have one.
    async fn send_packet(&mut self, packet: BitchatPacket) {
        let mtu = self.link.mtu();
        let packets = if Fragmenter::needs_fragmentation(&packet, mtu) {
            // two bytes of headroom keep the padded fragment inside the
            // MTU-sized padding bucket
            match Fragmenter::fragment(&packet, mtu.saturating_sub(2)) {
                Ok(fragments) => fragments,
                Err(e) => {
                    warn!("fragmentation failed: {}", e);
                    return;
                }
            }
        } else {
            vec![packet.clone()]
        };

        let direct_link = packet.recipient_id.and_then(|recipient| {
            self.shared
                .peers
                .read()
                .expect("peer table lock")
                .get(&recipient)
                .and_then(|info| info.link)
        });

        for piece in packets {
            let frame = match piece.encode(true) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("encode failed: {}", e);
                    return;
                }
            };
            let result = match direct_link {
                Some(link) => self.link.send_frame(link, &frame).await,
                None => self.link.broadcast_frame(&frame, None).await,
            };
            if let Err(e) = result {
                debug!("link send failed: {}", e);
            }
        }
    }

    async fn send_announce(&mut self) {
        let announce = AnnouncePayload {
            nickname: self.shared.nickname.read().expect("nickname lock").clone(),
            noise_static_key: self.identity.noise.public_key_bytes(),
            identity_key: self.identity.identity.public_key_bytes(),
        };
        let Ok(payload) = announce.encode() else {
            return;
        };
        let mut packet =
            BitchatPacket::new(MessageType::Announce, self.my_peer_id(), self.now(), payload);
        packet.sign(&self.identity.identity);
        self.send_packet(packet).await;
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    /// Refresh last-seen; link binding is the announce handler's business
    fn touch_peer(&mut self, peer_id: PeerId, _via: Option<LinkId>, now: Timestamp) {
        let mut peers = self.shared.peers.write().expect("peer table lock");
        peers.entry(peer_id).or_default().last_seen = now;
    }

    async fn maintenance(&mut self) {
        let now = self.now();

        self.reassembler.expire(now);

        // handshake deadlines and idle sessions
        let idle_ms = self.config.session.idle_timeout.as_millis() as u64;
        let timed_out: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.handshake_expired(now))
            .map(|(peer, _)| *peer)
            .collect();
        for peer_id in timed_out {
            warn!(peer = %peer_id, "handshake timed out");
            self.sessions.remove(&peer_id);
            self.events.emit(AppEvent::HandshakeTimedOut { peer_id });
        }
        let idled: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.idle_expired(now, idle_ms))
            .map(|(peer, _)| *peer)
            .collect();
        for peer_id in idled {
            debug!(peer = %peer_id, "session idled out");
            self.kill_session(peer_id);
        }

        // private sends past their deadline
        for (peer_id, queue) in self.pending_private.iter_mut() {
            queue.retain(|item| {
                if now > item.deadline {
                    if let Some(message_id) = &item.message_id {
                        self.events.emit(AppEvent::MessageUnreachable {
                            peer_id: *peer_id,
                            message_id: message_id.clone(),
                        });
                    }
                    false
                } else {
                    true
                }
            });
        }
        self.pending_private.retain(|_, queue| !queue.is_empty());

        // re-initiate handshakes for queued sends while the peer is in reach
        let queued_peers: Vec<PeerId> = self.pending_private.keys().copied().collect();
        for peer_id in queued_peers {
            let session_alive = self
                .sessions
                .get(&peer_id)
                .map(|s| s.state() != SessionState::Dead)
                .unwrap_or(false);
            if session_alive {
                continue;
            }
            let connected = self
                .shared
                .peers
                .read()
                .expect("peer table lock")
                .get(&peer_id)
                .map(|info| info.link.is_some())
                .unwrap_or(false);
            if connected {
                self.ensure_handshake(peer_id).await;
            }
        }

        // pipeline flush on its own (shorter) cadence
        self.shared
            .pipeline
            .lock()
            .expect("pipeline lock")
            .flush_due(now);

        // pending file expiry on a 30 s cadence
        if now.millis_since(self.last_file_expiry) >= FILE_EXPIRE_INTERVAL_MS {
            self.last_file_expiry = now;
            self.shared.files.expire_tick();
        }
    }

    fn disconnect_all(&mut self) {
        let peers: Vec<PeerId> = {
            let mut table = self.shared.peers.write().expect("peer table lock");
            let ids = table.keys().copied().collect();
            table.clear();
            ids
        };
        self.links_to_peers.clear();
        for session in self.sessions.values_mut() {
            session.fail();
        }
        self.sessions.clear();
        for peer_id in peers {
            self.events.emit(AppEvent::PeerDisconnected { peer_id });
        }
    }

    fn panic_clear(&mut self) {
        self.sessions.clear();
        self.pending_private.clear();
        self.dedup.clear();
        self.reassembler.clear();
        self.shared.files.clear_all();
        self.shared
            .favorites
            .write()
            .expect("favorites lock")
            .clear();
        self.shared
            .pipeline
            .lock()
            .expect("pipeline lock")
            .clear();
        if let Some(store) = &self.identity_store {
            if let Err(e) = store.clear() {
                warn!("identity store clear failed: {}", e);
            }
        }
        info!("panic clear complete");
    }
}
