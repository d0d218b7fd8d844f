//! # Repository Signing Keys
//!
//! Every commit is signed by its repository's key. Where keys live (HSM,
//! encrypted file, memory) is a deployment decision, so the coordinator only
//! sees the [`Keystore`] trait.

use std::collections::HashMap;
use std::sync::RwLock;

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::error::{Error, Result};
use crate::types::Did;

/// Source of repository signing keys.
///
/// # Rust Pattern: Send + Sync Trait Objects
///
/// The host stores an `Arc<dyn Keystore>` shared by every request task, so
/// implementations must be thread-safe.
pub trait Keystore: Send + Sync + 'static {
    /// Returns the signing key for `did`, if one is registered.
    fn signing_key(&self, did: &Did) -> Result<Option<SigningKey>>;

    /// Registers (or replaces) the signing key for `did`.
    fn store(&self, did: &Did, key: SigningKey) -> Result<()>;
}

/// An in-process keystore. Keys are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryKeystore {
    keys: RwLock<HashMap<Did, SigningKey>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keystore for MemoryKeystore {
    fn signing_key(&self, did: &Did) -> Result<Option<SigningKey>> {
        let keys = self
            .keys
            .read()
            .map_err(|_| Error::Storage("keystore lock poisoned".to_string()))?;
        Ok(keys.get(did).cloned())
    }

    fn store(&self, did: &Did, key: SigningKey) -> Result<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| Error::Storage("keystore lock poisoned".to_string()))?;
        keys.insert(did.clone(), key);
        Ok(())
    }
}

/// Generates a fresh Ed25519 signing key from the OS random source.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Renders the reference stored in a repository head for its signing key.
pub fn key_ref(key: &VerifyingKey) -> String {
    format!(
        "ed25519:{}",
        BASE32_NOPAD.encode(key.as_bytes()).to_ascii_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_keystore_roundtrip() {
        let store = MemoryKeystore::new();
        let did = Did::parse("did:example:alice").unwrap();
        assert!(store.signing_key(&did).unwrap().is_none());

        let key = SigningKey::from_bytes(&[7u8; 32]);
        store.store(&did, key.clone()).unwrap();
        let loaded = store.signing_key(&did).unwrap().unwrap();
        assert_eq!(loaded.to_bytes(), key.to_bytes());
    }

    #[test]
    fn test_key_ref_format() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let r = key_ref(&key.verifying_key());
        assert!(r.starts_with("ed25519:"));
        assert_eq!(r, r.to_ascii_lowercase());
        assert_eq!(r, key_ref(&key.verifying_key()));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(generate_signing_key().to_bytes(), generate_signing_key().to_bytes());
    }
}
