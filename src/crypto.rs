//! # Stream Cipher Layer
//!
//! AES-CTR protection for result payloads, plus the SHA-256 password digest
//! used by the authentication handshake.
//!
//! An encrypted message is `nonce (8B) || ciphertext`, where the counter
//! block is the nonce followed by a 64-bit big-endian counter starting at
//! zero. Ciphertext length always equals plaintext length; there is no
//! padding and no authentication tag. Integrity is NOT cryptographically
//! verified — callers may apply heuristic format checks on decrypted output
//! but must not treat them as security guarantees.

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr64BE;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Nonce length in bytes, fixed by the wire protocol.
pub const NONCE_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid AES key length: {0} bytes (must be 16, 24 or 32)")]
    InvalidKeyLength(usize),

    #[error("encrypted input too short: {0} bytes (need nonce plus at least one byte)")]
    InputTooShort(usize),
}

/// Check a pre-shared key without touching any data.
pub fn validate_key(key: &[u8]) -> Result<(), CryptoError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        other => Err(CryptoError::InvalidKeyLength(other)),
    }
}

fn apply_keystream(key: &[u8], nonce: &[u8; NONCE_LEN], data: &mut [u8]) -> Result<(), CryptoError> {
    let mut iv = [0u8; 16];
    iv[..NONCE_LEN].copy_from_slice(nonce);
    match key.len() {
        16 => Ctr64BE::<Aes128>::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .apply_keystream(data),
        24 => Ctr64BE::<Aes192>::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .apply_keystream(data),
        32 => Ctr64BE::<Aes256>::new_from_slices(key, &iv)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?
            .apply_keystream(data),
        other => return Err(CryptoError::InvalidKeyLength(other)),
    }
    Ok(())
}

/// Encrypt `plaintext` under a fresh random 8-byte nonce.
///
/// Returns `nonce || ciphertext`. The nonce must never repeat under the
/// same key; it is drawn from the thread RNG per call.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    validate_key(key)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(plaintext);
    apply_keystream(key, &nonce, &mut out[NONCE_LEN..])?;
    Ok(out)
}

/// Invert [`encrypt`]: split off the nonce, apply the same keystream.
pub fn decrypt(key: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    validate_key(key)?;
    if payload.len() < NONCE_LEN + 1 {
        return Err(CryptoError::InputTooShort(payload.len()));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&payload[..NONCE_LEN]);

    let mut plaintext = payload[NONCE_LEN..].to_vec();
    apply_keystream(key, &nonce, &mut plaintext)?;
    Ok(plaintext)
}

/// Hex-encoded SHA-256 digest of the password, as sent on the wire.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Constant-time equality for credential digests. Length mismatch returns
/// early, which leaks only the length — both sides compare fixed-size hex
/// digests in practice.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
