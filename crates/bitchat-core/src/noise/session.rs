//! Per-peer Noise session state machine
//!
//! ```text
//! Handshaking { role } -> Established -> Dead
//! ```
//!
//! A session is created on first need, reaches `Established` after the third
//! handshake message, and dies on authentication failure, explicit leave, or
//! idle/handshake timeout. Dead sessions keep no key material.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::errors::{Result, SessionError};
use crate::identity::NoiseKeyPair;
use crate::noise::{NoiseHandshake, NoiseTransport};
use crate::types::{Fingerprint, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Roles & States
// ----------------------------------------------------------------------------

/// Which side of the XX pattern we are playing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

impl fmt::Display for HandshakeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeRole::Initiator => write!(f, "initiator"),
            HandshakeRole::Responder => write!(f, "responder"),
        }
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in flight
    Handshaking,
    /// Transport ciphers are live
    Established,
    /// Torn down; a fresh session must be created to talk again
    Dead,
}

/// Resolve two racing initiators: the side with the lexicographically
/// higher static public key keeps the initiator role.
pub fn local_wins_initiator_race(local_static: &[u8; 32], remote_static: &[u8; 32]) -> bool {
    local_static > remote_static
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// One Noise session with a remote peer
pub struct NoiseSession {
    peer_id: PeerId,
    role: HandshakeRole,
    state: SessionState,
    handshake: Option<NoiseHandshake>,
    transport: Option<NoiseTransport>,
    remote_fingerprint: Option<Fingerprint>,
    reorder: ReorderQueue,
    replay_window: usize,
    created_at: Timestamp,
    last_activity: Timestamp,
    handshake_deadline: Timestamp,
}

impl fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoiseSession")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl NoiseSession {
    /// Start a session as initiator; `first_message()` yields message 1
    pub fn new_initiator(
        peer_id: PeerId,
        local_key: &NoiseKeyPair,
        config: &SessionConfig,
        now: Timestamp,
    ) -> Result<Self> {
        Ok(Self::new(
            peer_id,
            HandshakeRole::Initiator,
            NoiseHandshake::initiator(local_key)?,
            config,
            now,
        ))
    }

    /// Start a session as responder to an incoming handshake init
    pub fn new_responder(
        peer_id: PeerId,
        local_key: &NoiseKeyPair,
        config: &SessionConfig,
        now: Timestamp,
    ) -> Result<Self> {
        Ok(Self::new(
            peer_id,
            HandshakeRole::Responder,
            NoiseHandshake::responder(local_key)?,
            config,
            now,
        ))
    }

    fn new(
        peer_id: PeerId,
        role: HandshakeRole,
        handshake: NoiseHandshake,
        config: &SessionConfig,
        now: Timestamp,
    ) -> Self {
        Self {
            peer_id,
            role,
            state: SessionState::Handshaking,
            handshake: Some(handshake),
            transport: None,
            remote_fingerprint: None,
            reorder: ReorderQueue::new(config.reorder_budget),
            replay_window: config.replay_window,
            created_at: now,
            last_activity: now,
            handshake_deadline: now.plus_millis(config.handshake_timeout.as_millis() as u64),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Fingerprint of the remote static key, known once the handshake
    /// reaches the message that carries it
    pub fn remote_fingerprint(&self) -> Option<Fingerprint> {
        self.remote_fingerprint
    }

    /// Whether an in-flight handshake has outlived its deadline
    pub fn handshake_expired(&self, now: Timestamp) -> bool {
        self.state == SessionState::Handshaking && now > self.handshake_deadline
    }

    /// Whether an established session has idled out
    pub fn idle_expired(&self, now: Timestamp, idle_timeout_ms: u64) -> bool {
        self.state == SessionState::Established
            && now.millis_since(self.last_activity) > idle_timeout_ms
    }

    /// Produce the initiator's opening message (`-> e`)
    pub fn first_message(&mut self, now: Timestamp) -> Result<Vec<u8>> {
        if self.role != HandshakeRole::Initiator {
            return Err(self.invalid_state("initiator", "responder"));
        }
        let handshake = self.handshake_mut()?;
        let message = handshake.write_message(&[])?;
        self.last_activity = now;
        Ok(message)
    }

    /// Consume an incoming handshake message and produce the reply, if the
    /// pattern calls for one. Promotes the session on completion.
    pub fn read_handshake(&mut self, input: &[u8], now: Timestamp) -> Result<Option<Vec<u8>>> {
        if self.state != SessionState::Handshaking {
            return Err(self.invalid_state("Handshaking", &format!("{:?}", self.state)));
        }

        let handshake = self.handshake_mut()?;
        if let Err(e) = handshake.read_message(input) {
            self.fail();
            return Err(e);
        }

        let mut reply = None;
        let handshake = self.handshake_mut()?;
        if !handshake.is_finished() && handshake.is_my_turn() {
            match handshake.write_message(&[]) {
                Ok(message) => reply = Some(message),
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        }

        self.last_activity = now;
        self.maybe_promote()?;
        Ok(reply)
    }

    /// Move to transport mode once the pattern has run to completion
    fn maybe_promote(&mut self) -> Result<()> {
        let finished = self
            .handshake
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(false);
        if !finished {
            return Ok(());
        }

        let handshake = self.handshake.take().expect("handshake present");
        if let Some(remote) = handshake.remote_static() {
            self.remote_fingerprint = Some(crate::noise::fingerprint_of(&remote));
        }
        self.transport = Some(handshake.into_transport(self.replay_window)?);
        self.state = SessionState::Established;
        debug!(peer = %self.peer_id, role = %self.role, "noise session established");
        Ok(())
    }

    /// Encrypt one application message
    pub fn seal(&mut self, plaintext: &[u8], now: Timestamp) -> Result<Vec<u8>> {
        let peer_id = self.peer_id;
        let transport = self.transport_mut()?;
        let frame = transport.seal(plaintext).map_err(|e| {
            warn!(peer = %peer_id, "seal failed, killing session");
            e
        });
        if frame.is_err() {
            self.fail();
        }
        self.last_activity = now;
        frame
    }

    /// Decrypt one frame and surface messages in nonce order.
    ///
    /// Frames ahead of the next expected nonce are parked up to the reorder
    /// budget; an authentication failure kills the session.
    pub fn open(&mut self, frame: &[u8], now: Timestamp) -> Result<Vec<Vec<u8>>> {
        let transport = self.transport_mut()?;
        match transport.open(frame) {
            Ok((nonce, plaintext)) => {
                self.last_activity = now;
                Ok(self.reorder.push(nonce, plaintext))
            }
            Err(e) => {
                if matches!(
                    e,
                    crate::BitchatError::Crypto(crate::errors::CryptoError::AuthenticationFailed)
                ) {
                    warn!(peer = %self.peer_id, "authentication failure, killing session");
                    self.fail();
                }
                Err(e)
            }
        }
    }

    /// Tear the session down, dropping all key material
    pub fn fail(&mut self) {
        self.state = SessionState::Dead;
        self.handshake = None;
        self.transport = None;
        self.reorder.clear();
    }

    fn handshake_mut(&mut self) -> Result<&mut NoiseHandshake> {
        let peer_id = self.peer_id;
        self.handshake.as_mut().ok_or_else(|| {
            SessionError::InvalidState {
                peer_id: peer_id.to_string(),
                expected: "Handshaking".into(),
                actual: "no handshake state".into(),
            }
            .into()
        })
    }

    fn transport_mut(&mut self) -> Result<&mut NoiseTransport> {
        if self.state != SessionState::Established {
            return Err(self.invalid_state("Established", &format!("{:?}", self.state)));
        }
        let peer_id = self.peer_id;
        self.transport.as_mut().ok_or_else(|| {
            SessionError::InvalidState {
                peer_id: peer_id.to_string(),
                expected: "Established".into(),
                actual: "no transport state".into(),
            }
            .into()
        })
    }

    fn invalid_state(&self, expected: &str, actual: &str) -> crate::BitchatError {
        SessionError::InvalidState {
            peer_id: self.peer_id.to_string(),
            expected: expected.into(),
            actual: actual.into(),
        }
        .into()
    }
}

// ----------------------------------------------------------------------------
// Reorder Queue
// ----------------------------------------------------------------------------

/// Surfaces decrypted messages in strict nonce order, parking gaps up to a
/// budget before giving up and releasing what it holds
struct ReorderQueue {
    next: u64,
    parked: BTreeMap<u64, Vec<u8>>,
    budget: usize,
}

impl ReorderQueue {
    fn new(budget: usize) -> Self {
        Self {
            next: 0,
            parked: BTreeMap::new(),
            budget,
        }
    }

    fn push(&mut self, nonce: u64, plaintext: Vec<u8>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();

        if nonce < self.next {
            // a gap we already surfaced past; deliver late but do not reorder
            out.push(plaintext);
            return out;
        }

        self.parked.insert(nonce, plaintext);

        // drain the consecutive run starting at `next`
        while let Some(plaintext) = self.parked.remove(&self.next) {
            out.push(plaintext);
            self.next += 1;
        }

        // budget exhausted: skip the gap to the oldest parked message
        if self.parked.len() > self.budget {
            if let Some((&oldest, _)) = self.parked.iter().next() {
                self.next = oldest;
                while let Some(plaintext) = self.parked.remove(&self.next) {
                    out.push(plaintext);
                    self.next += 1;
                }
            }
        }

        out
    }

    fn clear(&mut self) {
        self.parked.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::default()
    }

    fn established_pair() -> (NoiseSession, NoiseSession) {
        let alice_key = NoiseKeyPair::generate();
        let bob_key = NoiseKeyPair::generate();
        let now = Timestamp::new(0);

        let mut alice =
            NoiseSession::new_initiator(PeerId::new([2; 8]), &alice_key, &config(), now).unwrap();
        let mut bob =
            NoiseSession::new_responder(PeerId::new([1; 8]), &bob_key, &config(), now).unwrap();

        let m1 = alice.first_message(now).unwrap();
        let m2 = bob.read_handshake(&m1, now).unwrap().unwrap();
        let m3 = alice.read_handshake(&m2, now).unwrap().unwrap();
        assert!(bob.read_handshake(&m3, now).unwrap().is_none());

        assert!(alice.is_established());
        assert!(bob.is_established());
        (alice, bob)
    }

    #[test]
    fn test_three_message_handshake() {
        let (alice, bob) = established_pair();
        assert!(alice.remote_fingerprint().is_some());
        assert!(bob.remote_fingerprint().is_some());
        assert_ne!(alice.remote_fingerprint(), bob.remote_fingerprint());
    }

    #[test]
    fn test_transport_round_trip_in_order() {
        let (mut alice, mut bob) = established_pair();
        let now = Timestamp::new(1);

        let frame = alice.seal(b"first", now).unwrap();
        let delivered = bob.open(&frame, now).unwrap();
        assert_eq!(delivered, vec![b"first".to_vec()]);
    }

    #[test]
    fn test_reordered_frames_surface_in_nonce_order() {
        let (mut alice, mut bob) = established_pair();
        let now = Timestamp::new(1);

        let f0 = alice.seal(b"zero", now).unwrap();
        let f1 = alice.seal(b"one", now).unwrap();
        let f2 = alice.seal(b"two", now).unwrap();

        assert!(bob.open(&f1, now).unwrap().is_empty());
        assert!(bob.open(&f2, now).unwrap().is_empty());
        assert_eq!(
            bob.open(&f0, now).unwrap(),
            vec![b"zero".to_vec(), b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn test_auth_failure_kills_session() {
        let (mut alice, mut bob) = established_pair();
        let now = Timestamp::new(1);

        let mut frame = alice.seal(b"payload", now).unwrap();
        let len = frame.len();
        frame[len - 1] ^= 0x01;
        assert!(bob.open(&frame, now).is_err());
        assert_eq!(bob.state(), SessionState::Dead);

        // dead sessions refuse traffic
        assert!(bob.seal(b"more", now).is_err());
    }

    #[test]
    fn test_replay_does_not_kill_session() {
        let (mut alice, mut bob) = established_pair();
        let now = Timestamp::new(1);

        let frame = alice.seal(b"payload", now).unwrap();
        bob.open(&frame, now).unwrap();
        assert!(bob.open(&frame, now).is_err());
        assert_eq!(bob.state(), SessionState::Established);
    }

    #[test]
    fn test_handshake_deadline() {
        let key = NoiseKeyPair::generate();
        let session = NoiseSession::new_initiator(
            PeerId::new([5; 8]),
            &key,
            &config(),
            Timestamp::new(0),
        )
        .unwrap();
        assert!(!session.handshake_expired(Timestamp::new(9_999)));
        assert!(session.handshake_expired(Timestamp::new(10_001)));
    }

    #[test]
    fn test_initiator_race_tiebreak() {
        let low = [0x01u8; 32];
        let high = [0xF0u8; 32];
        assert!(local_wins_initiator_race(&high, &low));
        assert!(!local_wins_initiator_race(&low, &high));
    }

    #[test]
    fn test_reorder_budget_overflow_releases_parked() {
        let mut queue = ReorderQueue::new(2);
        // nonce 0 never arrives; park 1..=3 (budget 2 exceeded at the third)
        assert!(queue.push(1, b"one".to_vec()).is_empty());
        assert!(queue.push(2, b"two".to_vec()).is_empty());
        let released = queue.push(3, b"three".to_vec());
        assert_eq!(
            released,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        // the skipped nonce still surfaces, late and unordered
        assert_eq!(queue.push(0, b"zero".to_vec()), vec![b"zero".to_vec()]);
    }
}
