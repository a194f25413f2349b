//! Crypto adapter: signature verification, key agreement and AEAD.
//!
//! Signing uses Ed25519 through [`Identity`](crate::identity::Identity).
//! Point-to-point LAN encryption uses an X25519 agreement between the
//! receiver's per-process encryption key and the sender's published one,
//! then AES-256-GCM. Both the key and the IV base come from the shared
//! secret; every packet XORs the IV base with a random salt sent in clear
//! ahead of the ciphertext.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::NetworkError;

/// Length of the per-packet IV salt prefixed to LAN ciphertext.
pub const IV_LEN: usize = 12;

/// Length of the AES-GCM authentication tag.
const TAG_LEN: usize = 16;

/// Verify an Ed25519 signature made by `public_key` over `message`.
pub fn verify(public_key: &[u8; 32], signature: &[u8; 64], message: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    verify_with(&key, signature, message)
}

/// Verify against an already-parsed verifying key.
pub fn verify_with(key: &VerifyingKey, signature: &[u8; 64], message: &[u8]) -> bool {
    let signature = Signature::from_bytes(signature);
    key.verify(message, &signature).is_ok()
}

/// The X25519 keypair used for LAN encryption. Regenerated per process.
pub struct EncryptionKeypair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl EncryptionKeypair {
    pub fn generate() -> Self {
        Self::from_secret(rand::random())
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        let public = MontgomeryPoint::mul_base_clamped(secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Agree on a symmetric key with a peer's public encryption key.
    pub fn derive_shared(&self, peer_public: &[u8; 32]) -> Result<SharedKey, NetworkError> {
        let shared = MontgomeryPoint(*peer_public).mul_clamped(self.secret);
        let shared = shared.to_bytes();
        // A low-order peer key collapses the agreement to zero.
        if shared == [0u8; 32] {
            return Err(NetworkError::Crypto("degenerate shared secret".into()));
        }
        Ok(SharedKey::from_secret(&shared))
    }
}

/// Symmetric key material agreed between two LAN sessions.
#[derive(Clone)]
pub struct SharedKey {
    key: [u8; 32],
    iv: [u8; IV_LEN],
}

impl SharedKey {
    fn from_secret(shared: &[u8; 32]) -> Self {
        let key: [u8; 32] = Sha256::new()
            .chain_update(shared)
            .chain_update(b"key")
            .finalize()
            .into();
        let iv_hash = Sha256::new()
            .chain_update(shared)
            .chain_update(b"iv")
            .finalize();
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&iv_hash[..IV_LEN]);
        Self { key, iv }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    fn nonce_for(&self, salt: &[u8]) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (n, s) in nonce.iter_mut().zip(salt) {
            *n ^= s;
        }
        nonce
    }

    /// Encrypt `plaintext`, returning `salt ‖ ciphertext ‖ tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, NetworkError> {
        let salt: [u8; IV_LEN] = rand::random();
        let nonce = self.nonce_for(&salt);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| NetworkError::Crypto(format!("Encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt the output of [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, NetworkError> {
        if data.len() < IV_LEN + TAG_LEN {
            return Err(NetworkError::Crypto("Ciphertext too short".into()));
        }
        let (salt, ciphertext) = data.split_at(IV_LEN);
        let nonce = self.nonce_for(salt);
        self.cipher()
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| NetworkError::Crypto(format!("Decryption failed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
