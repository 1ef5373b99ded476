// SPDX-FileCopyrightText: 2026 Tether Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Encryption Envelope
//!
//! Password-derived authenticated encryption for wire payloads.
//!
//! Envelope format: `salt (8 bytes) || iv (12 bytes) || ciphertext || tag (16 bytes)`
//!
//! The key is derived per call with PBKDF2-HMAC-SHA256 over the shared
//! passphrase and a fresh random salt, producing a 128-bit AES-GCM key. The
//! authentication tag is appended to the ciphertext (not prepended), which
//! matches the common cross-platform AEAD layout so heterogeneous clients
//! can decrypt without extra framing.

use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use zeroize::Zeroize;

/// Salt length prefixed to every envelope.
pub const SALT_LEN: usize = 8;
/// AES-GCM IV length (96 bits).
pub const IV_LEN: usize = 12;
/// AES-GCM authentication tag length (128 bits).
pub const TAG_LEN: usize = 16;
/// PBKDF2 iteration count; part of the wire contract with clients.
const KEY_ITERATIONS: u32 = 10_000;
/// Derived key length (128 bits).
const KEY_LEN: usize = 16;

/// Encryption envelope error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("input too short: {len} bytes, envelope overhead is {overhead}")]
    InputTooShort { len: usize, overhead: usize },
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: data may be corrupted or wrong password")]
    DecryptionFailed,
    #[error("random generator failure")]
    RngFailed,
}

/// Fills a new buffer with cryptographically secure random bytes.
///
/// Used for envelope salts/IVs and for the authentication transmission
/// check issued at connect time.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes).map_err(|_| CryptoError::RngFailed)?;
    Ok(bytes)
}

/// Derives a 128-bit AES key from the shared passphrase and a salt.
fn derive_key(password: &str, salt: &[u8]) -> Result<LessSafeKey, CryptoError> {
    let mut key_bytes = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(KEY_ITERATIONS).expect("iteration count is non-zero"),
        salt,
        password.as_bytes(),
        &mut key_bytes,
    );

    let unbound =
        UnboundKey::new(&AES_128_GCM, &key_bytes).map_err(|_| CryptoError::EncryptionFailed);
    key_bytes.zeroize();
    Ok(LessSafeKey::new(unbound?))
}

/// Encrypts a payload under the shared passphrase.
///
/// Output format: `salt (8) || iv (12) || ciphertext || tag (16)`. A fresh
/// salt and IV are generated per call.
pub fn encrypt(password: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let salt = random_bytes(SALT_LEN)?;
    let iv = random_bytes(IV_LEN)?;

    let key = derive_key(password, &salt)?;
    let nonce_bytes: [u8; IV_LEN] = iv
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(SALT_LEN + IV_LEN + in_out.len());
    output.extend_from_slice(&salt);
    output.extend_from_slice(&iv);
    output.extend_from_slice(&in_out);
    Ok(output)
}

/// Decrypts an envelope produced by [`encrypt`].
///
/// Undersized input is rejected before any key derivation is attempted. A
/// wrong password or tampered data fails the authentication tag check and
/// never silently returns garbage.
pub fn decrypt(password: &str, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    const OVERHEAD: usize = SALT_LEN + IV_LEN + TAG_LEN;
    if data.len() < OVERHEAD {
        return Err(CryptoError::InputTooShort {
            len: data.len(),
            overhead: OVERHEAD,
        });
    }

    let (salt, rest) = data.split_at(SALT_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);

    let key = derive_key(password, salt)?;
    let nonce_bytes: [u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::DecryptionFailed)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut buffer = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut buffer)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(plaintext.to_vec())
}
