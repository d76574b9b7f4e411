//! AES-256-GCM payload encryption.

use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{P2pError, Result, TransformStage};

const NONCE_LEN: usize = 12;

/// Encrypts every payload with AES-256-GCM.
///
/// Output is a random 96-bit nonce followed by the ciphertext. Keys are
/// derived from passphrases with SHA-256; individual peers may use their own
/// passphrase, everyone else shares the default one.
#[derive(Clone)]
pub struct EncryptedStage {
    default: Aes256Gcm,
    peers: HashMap<(String, u16), Aes256Gcm>,
}

fn derive_key(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}

fn cipher(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

impl EncryptedStage {
    /// Stage key.
    pub const KEY: u8 = 1;

    /// Creates a stage keyed by `passphrase` for every peer.
    #[must_use]
    pub fn new(passphrase: &str) -> Self {
        Self::with_key(derive_key(passphrase))
    }

    /// Creates a stage from a raw 256-bit key.
    #[must_use]
    pub fn with_key(key: [u8; 32]) -> Self {
        Self {
            default: cipher(&key),
            peers: HashMap::new(),
        }
    }

    /// Uses a separate passphrase for the peer at `host:port`.
    #[must_use]
    pub fn with_peer(mut self, host: impl Into<String>, port: u16, passphrase: &str) -> Self {
        self.peers
            .insert((host.into(), port), cipher(&derive_key(passphrase)));
        self
    }

    fn cipher_for(&self, host: &str, port: u16) -> &Aes256Gcm {
        if self.peers.is_empty() {
            return &self.default;
        }
        self.peers
            .get(&(host.to_string(), port))
            .unwrap_or(&self.default)
    }

    fn error(reason: impl Into<String>) -> P2pError {
        P2pError::Transform {
            key: Self::KEY,
            reason: reason.into(),
        }
    }
}

impl TransformStage for EncryptedStage {
    fn key(&self) -> u8 {
        Self::KEY
    }

    fn pack(&self, host: &str, port: u16, data: Bytes) -> Result<Bytes> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher_for(host, port)
            .encrypt(Nonce::from_slice(&nonce), &data[..])
            .map_err(|e| Self::error(format!("encrypt failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out.into())
    }

    fn consume(&self, host: &str, port: u16, data: Bytes) -> Result<Bytes> {
        if data.len() < NONCE_LEN {
            return Err(Self::error("payload shorter than nonce"));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher_for(host, port)
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Self::error(format!("decrypt failed: {e}")))?;
        Ok(plaintext.into())
    }
}

impl fmt::Debug for EncryptedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedStage")
            .field("peer_keys", &self.peers.len())
            .finish_non_exhaustive()
    }
}
