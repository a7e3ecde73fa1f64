//! Attested OHTTP key set.
//!
//! A node publishes one current key and may still hold keys that were
//! attested but are no longer published (clients with a cached key config
//! keep using them until they expire). The whole set is replaced at once on
//! rotation; readers work from a snapshot.

use crate::error::{CryptoError, Result};
use crate::ohttp::PrivateKey;
use crate::time::is_expired;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use zeroize::Zeroizing;

/// Where the private half of an attested key lives.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrivateKeySource {
    InMemory { private_key_b64: String },
    Keychain { reference: String },
}

impl std::fmt::Debug for PrivateKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InMemory { .. } => f.write_str("InMemory(<redacted>)"),
            Self::Keychain { reference } => write!(f, "Keychain({reference})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedKey {
    pub key_id: u8,
    /// Milliseconds since the epoch; zero never expires.
    #[serde(default)]
    pub expires_at_ms: u64,
    /// Release digest of the software this key was attested for.
    #[serde(default)]
    pub release_digest: String,
    pub source: PrivateKeySource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedKeySet {
    pub current: Option<AttestedKey>,
    #[serde(default)]
    pub unpublished: Vec<AttestedKey>,
}

impl AttestedKeySet {
    pub fn find(&self, key_id: u8) -> Option<&AttestedKey> {
        self.current
            .iter()
            .chain(self.unpublished.iter())
            .find(|k| k.key_id == key_id)
    }

    pub fn len(&self) -> usize {
        usize::from(self.current.is_some()) + self.unpublished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds the latest attested key set.
#[derive(Debug, Default)]
pub struct AttestedKeyStore {
    inner: Mutex<Arc<AttestedKeySet>>,
}

impl AttestedKeyStore {
    pub fn new(set: AttestedKeySet) -> Self {
        Self {
            inner: Mutex::new(Arc::new(set)),
        }
    }

    pub fn snapshot(&self) -> Arc<AttestedKeySet> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, set: AttestedKeySet) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(set);
    }

    /// Find a usable key by its OHTTP key id.
    pub fn lookup(&self, key_id: u8, now_ms: u64) -> Result<AttestedKey> {
        let snapshot = self.snapshot();
        let key = snapshot
            .find(key_id)
            .ok_or(CryptoError::UnknownKeyId(key_id))?;
        if is_expired(key.expires_at_ms, now_ms) {
            return Err(CryptoError::ExpiredKey {
                key_id,
                expired_at_ms: key.expires_at_ms,
            });
        }
        Ok(key.clone())
    }
}

/// Resolves keychain references to private keys. Implementations may block.
pub trait Keychain: Send + Sync {
    fn load(&self, reference: &str) -> Result<PrivateKey>;
}

/// A keychain backed by a directory of `<reference>.key` files, each holding
/// a base64-encoded X25519 private key.
#[derive(Debug, Clone)]
pub struct DirectoryKeychain {
    root: PathBuf,
}

impl DirectoryKeychain {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, reference: &str) -> Result<PathBuf> {
        let valid = !reference.is_empty()
            && reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CryptoError::Keychain(format!(
                "invalid keychain reference {reference:?}"
            )));
        }
        Ok(self.root.join(format!("{reference}.key")))
    }

    /// Store a key under `reference`, replacing any existing one.
    pub fn store(&self, reference: &str, key: &PrivateKey) -> Result<()> {
        let path = self.path_for(reference)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(key.to_bytes().as_slice());
        std::fs::write(&path, encoded)
            .map_err(|e| CryptoError::Keychain(format!("write {}: {e}", path.display())))
    }
}

impl Keychain for DirectoryKeychain {
    fn load(&self, reference: &str) -> Result<PrivateKey> {
        let path = self.path_for(reference)?;
        let encoded = Zeroizing::new(
            std::fs::read_to_string(&path)
                .map_err(|e| CryptoError::Keychain(format!("read {}: {e}", path.display())))?,
        );
        decode_private_key(encoded.trim())
    }
}

fn decode_private_key(encoded: &str) -> Result<PrivateKey> {
    let bytes = Zeroizing::new(
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Keychain(format!("key is not valid base64: {e}")))?,
    );
    PrivateKey::from_bytes(&bytes)
}

/// Materialize the private key of an attested key.
pub fn resolve_private_key(key: &AttestedKey, keychain: &dyn Keychain) -> Result<PrivateKey> {
    match &key.source {
        PrivateKeySource::InMemory { private_key_b64 } => decode_private_key(private_key_b64),
        PrivateKeySource::Keychain { reference } => keychain.load(reference),
    }
}

/// An in-memory source for `key`.
pub fn in_memory_source(key: &PrivateKey) -> PrivateKeySource {
    PrivateKeySource::InMemory {
        private_key_b64: base64::engine::general_purpose::STANDARD
            .encode(key.to_bytes().as_slice()),
    }
}
