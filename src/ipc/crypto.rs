// Key agreement and payload encryption for a connection

use crate::ipc::error::{IpcError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Length of the AES-GCM nonce prefixed to every ciphertext
pub const NONCE_LEN: usize = 12;
/// Length of an X25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

const KEY_DERIVATION_LABEL: &[u8] = b"courier-ipc-aes-256-gcm";

/// One side of a Diffie-Hellman exchange
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Generate a fresh ephemeral key pair
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Combine with the peer's public key and derive the session cipher
    pub fn derive(self, peer_public: &[u8]) -> Result<SessionCipher> {
        let peer: [u8; PUBLIC_KEY_LEN] = peer_public.try_into().map_err(|_| {
            IpcError::HandshakeFailed(format!(
                "peer public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                peer_public.len()
            ))
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(IpcError::HandshakeFailed(
                "non-contributory peer public key".to_string(),
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(shared.as_bytes());
        hasher.update(KEY_DERIVATION_LABEL);
        let key: [u8; 32] = hasher.finalize().into();

        Ok(SessionCipher::new(&key))
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// AES-256-GCM cipher bound to one connection
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt with a fresh random nonce; output is `nonce || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| IpcError::Crypto("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(IpcError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| IpcError::Crypto("decryption failed".to_string()))
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}
