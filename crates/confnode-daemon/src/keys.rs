//! Attested OHTTP keys published by this node.
//!
//! The attestation agent writes the current key set to
//! `<state_dir>/attested_keys.json`; the daemon loads it at startup and again
//! on every SIGHUP.

use anyhow::{Context, Result};
use async_trait::async_trait;
use confnode_crypto::{AttestedKeySet, AttestedKeyStore};
use confnode_job::AttestationClient;
use std::path::PathBuf;
use std::sync::Arc;

/// Reads the attested key set from a JSON file.
#[derive(Debug, Clone)]
pub struct FileAttestationClient {
    path: PathBuf,
}

impl FileAttestationClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AttestationClient for FileAttestationClient {
    async fn request_attested_key_set(&self) -> Result<AttestedKeySet> {
        let contents = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        serde_json::from_slice(&contents)
            .with_context(|| format!("invalid key set {}", self.path.display()))
    }
}

/// Fetch the key set and swap it into `store`. Returns the number of keys.
pub async fn refresh(client: &dyn AttestationClient, store: &AttestedKeyStore) -> Result<usize> {
    let set = client.request_attested_key_set().await?;
    let count = set.len();
    let current = set.current.as_ref().map(|k| k.key_id);
    store.replace(set);
    tracing::info!(keys = count, current_key_id = ?current, "attested key set loaded");
    Ok(count)
}

/// Reload the key set whenever the process receives SIGHUP. A failed reload
/// keeps the previous set.
pub fn spawn_reload_on_sighup(
    client: Arc<dyn AttestationClient>,
    store: Arc<AttestedKeyStore>,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    Ok(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            if let Err(e) = refresh(client.as_ref(), &store).await {
                tracing::warn!(err = %format!("{e:#}"), "key set reload failed; keeping previous set");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use confnode_crypto::keys::in_memory_source;
    use confnode_crypto::ohttp::generate_keypair;
    use confnode_crypto::AttestedKey;

    fn key_set(key_id: u8) -> AttestedKeySet {
        let (sk, _) = generate_keypair();
        AttestedKeySet {
            current: Some(AttestedKey {
                key_id,
                expires_at_ms: 0,
                release_digest: "sha256:node".to_string(),
                source: in_memory_source(&sk),
            }),
            unpublished: Vec::new(),
        }
    }

    #[tokio::test]
    async fn refresh_replaces_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attested_keys.json");
        std::fs::write(&path, serde_json::to_vec(&key_set(3)).unwrap()).unwrap();

        let client = FileAttestationClient::new(&path);
        let store = AttestedKeyStore::default();
        assert_eq!(refresh(&client, &store).await.unwrap(), 1);
        assert!(store.lookup(3, 0).is_ok());

        std::fs::write(&path, serde_json::to_vec(&key_set(4)).unwrap()).unwrap();
        refresh(&client, &store).await.unwrap();
        assert!(store.lookup(3, 0).is_err());
        assert!(store.lookup(4, 0).is_ok());
    }

    #[tokio::test]
    async fn broken_file_keeps_the_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attested_keys.json");
        std::fs::write(&path, "{not json").unwrap();

        let client = FileAttestationClient::new(&path);
        let store = AttestedKeyStore::new(key_set(1));
        assert!(refresh(&client, &store).await.is_err());
        assert!(store.lookup(1, 0).is_ok());
    }
}
