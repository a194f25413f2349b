//! LAN client registry: records of the sessions we have heard a
//! `Clienthello` from, keyed by session id.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::identity::{self, AccountId};

/// The body of a `Clienthello` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub long_id: String,
    pub username: String,
    /// Base64 Ed25519 verifying key used for LAN signatures.
    pub signing_key: String,
    /// Base64 X25519 public key used for LAN encryption.
    pub encryption_key: String,
    /// 32-bit hash of the raw signing key bytes.
    pub key_hash: u32,
}

impl ClientHello {
    pub fn key_hash_of(signing_key: &[u8; 32]) -> u32 {
        xxhash_rust::xxh32::xxh32(signing_key, 0)
    }

    pub fn new(long_id: &str, username: &str, signing_key: &[u8; 32], encryption_key: &[u8; 32]) -> Self {
        Self {
            long_id: long_id.to_string(),
            username: username.to_string(),
            signing_key: STANDARD.encode(signing_key),
            encryption_key: STANDARD.encode(encryption_key),
            key_hash: Self::key_hash_of(signing_key),
        }
    }

    /// Check internal consistency and extract the keys.
    ///
    /// Fails if a key is malformed, if `key_hash` does not match the signing
    /// key, or if `long_id` does not name the signing key.
    pub fn validate(&self) -> Result<(VerifyingKey, [u8; 32]), String> {
        let signing = decode_key(&self.signing_key).ok_or("malformed signing key")?;
        if Self::key_hash_of(&signing) != self.key_hash {
            return Err("signing key hash mismatch".to_string());
        }
        let signing_key =
            VerifyingKey::from_bytes(&signing).map_err(|_| "signing key is not a curve point")?;
        if identity::long_id_of(&signing_key) != self.long_id {
            return Err("long id does not match signing key".to_string());
        }
        let encryption = decode_key(&self.encryption_key).ok_or("malformed encryption key")?;
        Ok((signing_key, encryption))
    }
}

fn decode_key(text: &str) -> Option<[u8; 32]> {
    STANDARD.decode(text).ok()?.try_into().ok()
}

/// A known LAN peer session.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub session_id: u32,
    pub long_id: String,
    pub account_id: AccountId,
    pub username: String,
    pub signing_key: VerifyingKey,
    pub encryption_key: [u8; 32],
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ClientRecord {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "SessionID": self.session_id,
            "LongID": self.long_id,
            "AccountID": self.account_id.to_string(),
            "Username": self.username,
        })
    }
}

/// Registry of known LAN sessions.
///
/// Written only from the poll thread.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<u32, ClientRecord>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a session. Returns `true` if it was new.
    pub fn upsert(&mut self, record: ClientRecord) -> bool {
        match self.clients.get_mut(&record.session_id) {
            Some(existing) => {
                let first_seen = existing.first_seen;
                *existing = ClientRecord { first_seen, ..record };
                false
            }
            None => {
                self.clients.insert(record.session_id, record);
                true
            }
        }
    }

    pub fn remove(&mut self, session_id: u32) -> Option<ClientRecord> {
        self.clients.remove(&session_id)
    }

    pub fn get(&self, session_id: u32) -> Option<&ClientRecord> {
        self.clients.get(&session_id)
    }

    pub fn contains(&self, session_id: u32) -> bool {
        self.clients.contains_key(&session_id)
    }

    /// Refresh a session's last-message time.
    pub fn touch(&mut self, session_id: u32) {
        if let Some(client) = self.clients.get_mut(&session_id) {
            client.last_seen = Utc::now();
        }
    }

    /// Find the most recently active session for an account.
    pub fn find_by_account(&self, account: AccountId) -> Option<&ClientRecord> {
        self.clients
            .values()
            .filter(|c| c.account_id == account)
            .max_by_key(|c| c.last_seen)
    }

    /// Remove and return sessions silent since before `cutoff`.
    pub fn prune_stale(&mut self, cutoff: DateTime<Utc>) -> Vec<ClientRecord> {
        let stale: Vec<u32> = self
            .clients
            .values()
            .filter(|c| c.last_seen < cutoff)
            .map(|c| c.session_id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.clients.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKeypair;
    use crate::identity::Identity;

    fn hello_for(identity: &Identity) -> ClientHello {
        ClientHello::new(
            identity.long_id(),
            "tester",
            &identity.public_key(),
            &EncryptionKeypair::generate().public_key(),
        )
    }

    fn record(session_id: u32, identity: &Identity) -> ClientRecord {
        let now = Utc::now();
        ClientRecord {
            session_id,
            long_id: identity.long_id().to_string(),
            account_id: identity.account_id(),
            username: "tester".to_string(),
            signing_key: identity.verifying_key(),
            encryption_key: [1u8; 32],
            first_seen: now,
            last_seen: now,
        }
    }

    #[test]
    fn test_hello_validates() {
        let identity = Identity::generate();
        let (key, _) = hello_for(&identity).validate().unwrap();
        assert_eq!(key, identity.verifying_key());
    }

    #[test]
    fn test_hello_key_hash_mismatch() {
        let identity = Identity::generate();
        let mut hello = hello_for(&identity);
        hello.key_hash ^= 1;
        assert!(hello.validate().unwrap_err().contains("hash"));
    }

    #[test]
    fn test_hello_long_id_mismatch() {
        let identity = Identity::generate();
        let mut hello = hello_for(&identity);
        hello.long_id = Identity::generate().long_id().to_string();
        assert!(hello.validate().is_err());
    }

    #[test]
    fn test_hello_malformed_key() {
        let identity = Identity::generate();
        let mut hello = hello_for(&identity);
        hello.encryption_key = "AAAA".to_string();
        assert!(hello.validate().is_err());
    }

    #[test]
    fn test_registry_upsert_and_remove() {
        let mut registry = ClientRegistry::new();
        let identity = Identity::generate();

        assert!(registry.upsert(record(1, &identity)));
        assert!(!registry.upsert(record(1, &identity)));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(1).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upsert_keeps_first_seen() {
        let mut registry = ClientRegistry::new();
        let identity = Identity::generate();
        let mut first = record(1, &identity);
        first.first_seen = Utc::now() - chrono::Duration::seconds(60);
        let original = first.first_seen;
        registry.upsert(first);

        let mut second = record(1, &identity);
        second.username = "renamed".to_string();
        registry.upsert(second);

        let stored = registry.get(1).unwrap();
        assert_eq!(stored.first_seen, original);
        assert_eq!(stored.username, "renamed");
    }

    #[test]
    fn test_find_by_account() {
        let mut registry = ClientRegistry::new();
        let a = Identity::generate();
        let b = Identity::generate();
        registry.upsert(record(1, &a));
        registry.upsert(record(2, &b));

        assert_eq!(registry.find_by_account(b.account_id()).unwrap().session_id, 2);
        assert!(registry.find_by_account(AccountId(0)).is_none());
    }

    #[test]
    fn test_prune_stale() {
        let mut registry = ClientRegistry::new();
        let identity = Identity::generate();
        let mut old = record(1, &identity);
        old.last_seen = Utc::now() - chrono::Duration::seconds(120);
        registry.upsert(old);
        registry.upsert(record(2, &identity));

        let pruned = registry.prune_stale(Utc::now() - chrono::Duration::seconds(30));
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].session_id, 1);
        assert!(registry.contains(2));
    }
}
