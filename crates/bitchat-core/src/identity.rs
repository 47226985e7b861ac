//! Identity keys, favorites, and the block list
//!
//! Two long-term keys per node: an Ed25519 identity key that signs announce
//! packets, and an X25519 static key for Noise. The fingerprint (and from it
//! the PeerId) is the SHA-256 of the Noise static public key. Persistence is
//! behind the narrow [`IdentityStore`] capability so the engine never touches
//! disk itself.

use std::collections::{HashMap, HashSet};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{CryptoRng, OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{CryptoError, Result};
use crate::types::{Fingerprint, PeerId};

// ----------------------------------------------------------------------------
// Identity Key Pair (Ed25519)
// ----------------------------------------------------------------------------

/// Ed25519 signing key pair used for announce signatures
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        Self::generate_with_rng(&mut OsRng)
    }

    /// Generate with a caller-supplied RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        let pair = Self::from_bytes(&secret);
        secret.zeroize();
        pair
    }

    /// Rebuild from raw secret bytes
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Secret key bytes (for persistence only)
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign arbitrary data
    pub fn sign<T: AsRef<[u8]>>(&self, data: T) -> [u8; 64] {
        self.signing_key.sign(data.as_ref()).to_bytes()
    }

    /// Verify a signature made by `public_key`
    pub fn verify<D: AsRef<[u8]>>(
        public_key: &[u8; 32],
        data: D,
        signature: &[u8; 64],
    ) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CryptoError::SignatureVerificationFailed)?;
        let signature = Signature::from_bytes(signature);
        verifying_key
            .verify(data.as_ref(), &signature)
            .map_err(|_| CryptoError::SignatureVerificationFailed.into())
    }
}

// ----------------------------------------------------------------------------
// Noise Key Pair (X25519)
// ----------------------------------------------------------------------------

/// X25519 static key pair for Noise sessions
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NoiseKeyPair {
    private_key: [u8; 32],
    #[zeroize(skip)]
    public_key: [u8; 32],
}

impl std::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish()
    }
}

impl NoiseKeyPair {
    /// Generate a fresh random static key
    pub fn generate() -> Self {
        Self::generate_with_rng(&mut OsRng)
    }

    /// Generate with a caller-supplied RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut private_key = [0u8; 32];
        rng.fill_bytes(&mut private_key);
        Self::from_bytes(&private_key)
    }

    /// Rebuild from raw secret bytes; the public key is re-derived with the
    /// same clamping snow applies, so the announced static always matches
    /// what the handshake transmits.
    pub fn from_bytes(private_key: &[u8; 32]) -> Self {
        use curve25519_dalek::montgomery::MontgomeryPoint;
        let public_key = MontgomeryPoint::mul_base_clamped(*private_key).to_bytes();
        Self {
            private_key: *private_key,
            public_key,
        }
    }

    /// Public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key
    }

    /// Secret key bytes (handed to the Noise builder)
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.private_key
    }

    /// SHA-256 fingerprint of the public key
    pub fn fingerprint(&self) -> Fingerprint {
        generate_fingerprint(self.public_key)
    }
}

/// SHA-256 fingerprint of any public key
pub fn generate_fingerprint<T: AsRef<[u8]>>(public_key: T) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(public_key.as_ref());
    Fingerprint::new(hasher.finalize().into())
}

// ----------------------------------------------------------------------------
// Local Identity
// ----------------------------------------------------------------------------

/// The node's own long-term keys and derived addresses
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub identity: IdentityKeyPair,
    pub noise: NoiseKeyPair,
}

impl LocalIdentity {
    /// Generate a brand new identity
    pub fn generate() -> Self {
        Self {
            identity: IdentityKeyPair::generate(),
            noise: NoiseKeyPair::generate(),
        }
    }

    /// Load from the store, generating and saving on first run
    pub fn load_or_generate(store: &dyn IdentityStore) -> Result<Self> {
        if let Some(stored) = store.load()? {
            return Ok(Self {
                identity: IdentityKeyPair::from_bytes(&stored.identity_secret),
                noise: NoiseKeyPair::from_bytes(&stored.noise_secret),
            });
        }
        let fresh = Self::generate();
        store.save(&StoredIdentity {
            identity_secret: fresh.identity.secret_key_bytes(),
            noise_secret: fresh.noise.private_key_bytes(),
        })?;
        Ok(fresh)
    }

    /// Fingerprint of the Noise static key
    pub fn fingerprint(&self) -> Fingerprint {
        self.noise.fingerprint()
    }

    /// PeerId derived from the fingerprint
    pub fn peer_id(&self) -> PeerId {
        self.fingerprint().to_peer_id()
    }
}

// ----------------------------------------------------------------------------
// Identity Store
// ----------------------------------------------------------------------------

/// Raw key material as persisted by the host
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoredIdentity {
    pub identity_secret: [u8; 32],
    pub noise_secret: [u8; 32],
}

/// Persistence capability for the long-term keys; the layout on disk is the
/// host's business
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredIdentity>>;
    fn save(&self, identity: &StoredIdentity) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// In-memory store for tests and ephemeral nodes
#[derive(Default)]
pub struct MemoryIdentityStore {
    stored: std::sync::Mutex<Option<StoredIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<StoredIdentity>> {
        Ok(self.stored.lock().expect("identity store lock").clone())
    }

    fn save(&self, identity: &StoredIdentity) -> Result<()> {
        *self.stored.lock().expect("identity store lock") = Some(identity.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.stored.lock().expect("identity store lock") = None;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Favorites & Block List
// ----------------------------------------------------------------------------

/// What we know about a remote identity
#[derive(Debug, Clone, Default)]
pub struct FavoriteEntry {
    pub nickname: Option<String>,
    pub is_favorite: bool,
    /// Relay public key, when the peer shared one; presence makes the peer
    /// relay-reachable
    pub nostr_pubkey: Option<String>,
}

/// Favorites registry and block list, keyed by fingerprint with a PeerId
/// index for wire-side lookups
#[derive(Debug, Default)]
pub struct FavoritesRegistry {
    entries: HashMap<Fingerprint, FavoriteEntry>,
    peer_index: HashMap<PeerId, Fingerprint>,
    blocked: HashSet<Fingerprint>,
}

impl FavoritesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer-id to fingerprint binding (from a verified announce)
    pub fn note_peer(&mut self, peer_id: PeerId, fingerprint: Fingerprint, nickname: &str) {
        self.peer_index.insert(peer_id, fingerprint);
        let entry = self.entries.entry(fingerprint).or_default();
        entry.nickname = Some(nickname.to_string());
    }

    /// Set or clear the favorite flag; returns the affected peer id if known
    pub fn set_favorite(&mut self, fingerprint: Fingerprint, is_favorite: bool) -> Option<PeerId> {
        self.entries.entry(fingerprint).or_default().is_favorite = is_favorite;
        self.peer_id_for(fingerprint)
    }

    /// Record the relay public key a peer shared with us
    pub fn set_nostr_pubkey(&mut self, fingerprint: Fingerprint, nostr_pubkey: Option<String>) {
        self.entries.entry(fingerprint).or_default().nostr_pubkey = nostr_pubkey;
    }

    pub fn block(&mut self, fingerprint: Fingerprint) {
        self.blocked.insert(fingerprint);
    }

    pub fn unblock(&mut self, fingerprint: Fingerprint) {
        self.blocked.remove(&fingerprint);
    }

    pub fn is_blocked(&self, fingerprint: &Fingerprint) -> bool {
        self.blocked.contains(fingerprint)
    }

    /// Whether the peer behind this id is blocked
    pub fn is_peer_blocked(&self, peer_id: PeerId) -> bool {
        self.peer_index
            .get(&peer_id)
            .map(|fp| self.blocked.contains(fp))
            .unwrap_or(false)
    }

    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<&FavoriteEntry> {
        self.entries.get(fingerprint)
    }

    pub fn fingerprint_for(&self, peer_id: PeerId) -> Option<Fingerprint> {
        self.peer_index.get(&peer_id).copied()
    }

    fn peer_id_for(&self, fingerprint: Fingerprint) -> Option<PeerId> {
        self.peer_index
            .iter()
            .find(|(_, fp)| **fp == fingerprint)
            .map(|(id, _)| *id)
    }

    /// Relay public key for a peer, if it shared one
    pub fn nostr_pubkey_for_peer(&self, peer_id: PeerId) -> Option<String> {
        let fingerprint = self.peer_index.get(&peer_id)?;
        self.entries.get(fingerprint)?.nostr_pubkey.clone()
    }

    /// Reverse lookup: which peer announced this relay public key
    pub fn peer_for_nostr_pubkey(&self, nostr_pubkey: &str) -> Option<PeerId> {
        let fingerprint = self.entries.iter().find_map(|(fp, entry)| {
            (entry.nostr_pubkey.as_deref() == Some(nostr_pubkey)).then_some(*fp)
        })?;
        self.peer_index
            .iter()
            .find(|(_, fp)| **fp == fingerprint)
            .map(|(peer_id, _)| *peer_id)
    }

    /// Wipe everything (panic clear)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.peer_index.clear();
        self.blocked.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
