// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! WireGuard key generation and at-rest sealing.
//!
//! Peer private keys are persisted only as AES-256-GCM ciphertext; the
//! plaintext is handed to the caller exactly once at allocation through
//! [`RevealOnce`].

use std::fmt;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use x25519_dalek::{PublicKey, StaticSecret};

/// Key sealing/opening failure. Deliberately detail-free: nothing about the
/// key material belongs in an error string.
#[derive(Debug, thiserror::Error)]
#[error("key cipher operation failed")]
pub struct CipherError;

/// A freshly generated WireGuard key pair, base64-encoded.
pub struct KeyPair {
    pub private_b64: String,
    pub public_b64: String,
}

/// Generate an x25519 key pair.
pub fn generate() -> KeyPair {
    let secret = StaticSecret::random_from_rng(&mut OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_b64: BASE64.encode(secret.to_bytes()),
        public_b64: BASE64.encode(public.as_bytes()),
    }
}

/// Encrypt a base64 private key for persistence. Returns (ciphertext, nonce).
pub fn seal(secret: &[u8; 32], private_b64: &str) -> Result<(Vec<u8>, Vec<u8>), CipherError> {
    let cipher = Aes256Gcm::new_from_slice(secret).map_err(|_| CipherError)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, private_b64.as_bytes())
        .map_err(|_| CipherError)?;
    Ok((ciphertext, nonce.to_vec()))
}

/// Decrypt a sealed private key back to its base64 form.
pub fn open(secret: &[u8; 32], ciphertext: &[u8], nonce: &[u8]) -> Result<String, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(secret).map_err(|_| CipherError)?;
    let nonce = Nonce::from_exact_iter(nonce.iter().copied()).ok_or(CipherError)?;
    let plaintext = cipher.decrypt(&nonce, ciphertext).map_err(|_| CipherError)?;
    String::from_utf8(plaintext).map_err(|_| CipherError)
}

/// A secret that can be read exactly once.
///
/// Not `Clone`, and `reveal` consumes the wrapper, so the type system
/// enforces the show-secret-once discipline. `Debug` is redacted.
pub struct RevealOnce(String);

impl RevealOnce {
    pub fn new(secret: String) -> Self {
        Self(secret)
    }

    /// Consume the wrapper and return the secret.
    pub fn reveal(self) -> String {
        self.0
    }
}

impl fmt::Debug for RevealOnce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RevealOnce(..)")
    }
}
