//! Process identity: the long-term signing keypair and the ids derived from it.

use std::fmt;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Base58 encoding of a verifying key; the durable, user-visible identity.
pub fn long_id_of(key: &VerifyingKey) -> String {
    bs58::encode(key.as_bytes()).into_string()
}

/// 32-bit hash of a long id, used as a compact lookup key.
pub fn short_id_of(long_id: &str) -> u32 {
    xxhash_rust::xxh32::xxh32(long_id.as_bytes(), 0)
}

/// The 8-byte account id carried as the target of targeted LAN packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u64);

impl AccountId {
    /// Derive the account id for a verifying key.
    pub fn of(key: &VerifyingKey) -> Self {
        Self(xxhash_rust::xxh3::xxh3_64(key.as_bytes()))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The identity of this process on the network.
///
/// Generated or loaded once at startup and immutable afterwards.
pub struct Identity {
    signing_key: SigningKey,
    long_id: String,
    short_id: u32,
    account_id: AccountId,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: String,
}

impl Identity {
    /// Create a fresh random identity.
    pub fn generate() -> Self {
        let secret: [u8; 32] = rand::random();
        Self::from_secret(secret)
    }

    /// Rebuild an identity from its 32-byte secret key.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying = signing_key.verifying_key();
        let long_id = long_id_of(&verifying);
        let short_id = short_id_of(&long_id);
        Self {
            account_id: AccountId::of(&verifying),
            signing_key,
            long_id,
            short_id,
        }
    }

    pub fn long_id(&self) -> &str {
        &self.long_id
    }

    pub fn short_id(&self) -> u32 {
        self.short_id
    }

    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw public key bytes as embedded in bus packets.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Save the identity to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            secret_key: hex::encode(self.signing_key.to_bytes()),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Load an identity from a JSON file, or generate (and persist) a new one
    /// if the file is missing.
    ///
    /// An unreadable file is never overwritten. It is renamed to
    /// `<name>.corrupt` first; if that fails too, the new identity is used
    /// for this run only.
    pub fn load_or_generate(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(identity) => return identity,
                Err(e) => {
                    let backup = corrupt_backup_path(path);
                    if let Err(rename_err) = std::fs::rename(path, &backup) {
                        tracing::warn!(
                            "Cannot load identity ({e}) or move it aside ({rename_err}), using a temporary identity"
                        );
                        return Self::generate();
                    }
                    tracing::warn!(
                        "Cannot load identity ({e}), moved it to {} and generating a new one",
                        backup.display()
                    );
                }
            }
        }

        let identity = Self::generate();
        if let Err(e) = identity.save_to_file(path) {
            tracing::warn!("Failed to persist new identity: {e}");
        }
        identity
    }

    fn load(path: &Path) -> Result<Self, String> {
        let data = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let file: IdentityFile = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        let bytes = hex::decode(file.secret_key).map_err(|e| e.to_string())?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "secret key must be 32 bytes".to_string())?;
        Ok(Self::from_secret(secret))
    }
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("long_id", &self.long_id)
            .field("short_id", &self.short_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_differ() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.long_id(), b.long_id());
        assert_ne!(a.account_id(), b.account_id());
    }

    #[test]
    fn test_long_id_is_base58_public_key() {
        let identity = Identity::generate();
        let decoded = bs58::decode(identity.long_id()).into_vec().unwrap();
        assert_eq!(decoded, identity.public_key().to_vec());
    }

    #[test]
    fn test_short_id_hashes_long_id() {
        let identity = Identity::generate();
        assert_eq!(identity.short_id(), short_id_of(identity.long_id()));
    }

    #[test]
    fn test_from_secret_is_deterministic() {
        let a = Identity::from_secret([7u8; 32]);
        let b = Identity::from_secret([7u8; 32]);
        assert_eq!(a.long_id(), b.long_id());
        assert_eq!(a.sign(b"hello"), b.sign(b"hello"));
    }

    #[test]
    fn test_identity_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let original = Identity::generate();
        original.save_to_file(&path).unwrap();

        let loaded = Identity::load_or_generate(&path);
        assert_eq!(loaded.long_id(), original.long_id());
    }

    #[test]
    fn test_identity_corrupt_file_is_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "{not json").unwrap();

        let identity = Identity::load_or_generate(&path);
        assert!(!identity.long_id().is_empty());

        // The unreadable original survives byte for byte.
        let backup = dir.path().join("identity.json.corrupt");
        assert_eq!(std::fs::read(&backup).unwrap(), b"{not json");

        // The replacement was persisted.
        let reloaded = Identity::load_or_generate(&path);
        assert_eq!(reloaded.long_id(), identity.long_id());
    }

    #[test]
    fn test_identity_truncated_file_is_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let original = Identity::generate();
        original.save_to_file(&path).unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();
        let truncated = saved[..saved.len() / 2].to_string();
        std::fs::write(&path, &truncated).unwrap();

        let replacement = Identity::load_or_generate(&path);
        assert_ne!(replacement.long_id(), original.long_id());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("identity.json.corrupt")).unwrap(),
            truncated
        );
    }
}
