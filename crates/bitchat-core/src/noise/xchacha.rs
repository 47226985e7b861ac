//! XChaCha20-Poly1305 with 24-byte nonces
//!
//! Used where the nonce must be sampled randomly rather than counted (file
//! chunk encryption): the 192-bit nonce space makes random collision
//! negligible. The construction derives a subkey via HChaCha20 and applies
//! ChaCha20-Poly1305 with the remaining nonce bytes, which is exactly what
//! the `chacha20poly1305` crate's `XChaCha20Poly1305` does.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::XChaCha20Poly1305;

use crate::errors::{CryptoError, Result};

/// Required key length
pub const KEY_LEN: usize = 32;

/// Required nonce length
pub const NONCE_LEN: usize = 24;

/// Encrypt `plaintext` under `key`/`nonce`, binding `aad`
pub fn seal(key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce = check_nonce(nonce)?;
    cipher
        .encrypt(
            nonce.into(),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed.into())
}

/// Decrypt and authenticate; any bit flip in ciphertext, tag, key or AAD
/// fails with `AuthenticationFailed`
pub fn open(key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce = check_nonce(nonce)?;
    cipher
        .decrypt(
            nonce.into(),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed.into())
}

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        }
        .into()
    })
}

fn check_nonce(nonce: &[u8]) -> Result<&[u8; NONCE_LEN]> {
    nonce.try_into().map_err(|_| {
        CryptoError::InvalidNonceLength {
            expected: NONCE_LEN,
            got: nonce.len(),
        }
        .into()
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
