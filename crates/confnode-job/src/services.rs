//! External collaborators a job calls out to.

use async_trait::async_trait;
use confnode_crypto::keys::resolve_private_key;
use confnode_crypto::ohttp::encapsulate_key;
use confnode_crypto::{
    AttestedKey, AttestedKeySet, AttestedKeyStore, ChunkKey, Keychain, PrivateKey, PublicKey,
    ResponseSecret,
};
use confnode_proto::app::v1::AttestationBundle;
use std::sync::Arc;

/// Checks a token-granting token against the request's one-time token.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(
        &self,
        token_granting_token: &[u8],
        one_time_token: &[u8],
        salt: &[u8],
    ) -> anyhow::Result<()>;
}

/// Decides whether a downstream worker may receive a request that reached
/// this node under `addressed`.
#[async_trait]
pub trait AttestationValidator: Send + Sync {
    async fn validate(
        &self,
        attestation: &[u8],
        addressed: &AttestedKey,
    ) -> anyhow::Result<AttestationBundle>;
}

/// The request key re-encrypted for one worker.
#[derive(Debug, Clone)]
pub struct RewrappedKey {
    pub key_id: u8,
    pub encapsulated_key: Vec<u8>,
    /// Opens the worker's response stream, or predicts it under bypass.
    pub response: ResponseSecret,
}

/// Re-encrypts the request key to a worker's attested public key.
#[async_trait]
pub trait KeyRewrapper: Send + Sync {
    async fn rewrap(&self, bundle: &AttestationBundle, dek: &ChunkKey)
    -> anyhow::Result<RewrappedKey>;
}

/// Rewraps with the same OHTTP encapsulation clients use.
#[derive(Debug, Default, Clone, Copy)]
pub struct HpkeKeyRewrapper;

#[async_trait]
impl KeyRewrapper for HpkeKeyRewrapper {
    async fn rewrap(
        &self,
        bundle: &AttestationBundle,
        dek: &ChunkKey,
    ) -> anyhow::Result<RewrappedKey> {
        let key_id = u8::try_from(bundle.key_id)
            .map_err(|_| anyhow::anyhow!("key id {} out of range", bundle.key_id))?;
        let public_key = PublicKey::from_bytes(&bundle.ohttp_public_key)?;
        let (encapsulated_key, response) = encapsulate_key(&public_key, key_id, dek)?;
        Ok(RewrappedKey {
            key_id,
            encapsulated_key,
            response,
        })
    }
}

/// Source of this node's attested OHTTP keys.
#[async_trait]
pub trait AttestationClient: Send + Sync {
    async fn request_attested_key_set(&self) -> anyhow::Result<AttestedKeySet>;
}

/// Shared by every job on a node.
#[derive(Clone)]
pub struct JobServices {
    pub token_validator: Arc<dyn TokenValidator>,
    pub attestation_validator: Arc<dyn AttestationValidator>,
    pub key_rewrapper: Arc<dyn KeyRewrapper>,
    pub keys: Arc<AttestedKeyStore>,
    pub keychain: Arc<dyn Keychain>,
}

impl JobServices {
    /// Resolve the private key of an attested key. Keychain lookups may block
    /// on secure hardware, so they run on the blocking pool.
    pub async fn private_key(&self, key: &AttestedKey) -> confnode_crypto::Result<PrivateKey> {
        let key = key.clone();
        let keychain = self.keychain.clone();
        match tokio::task::spawn_blocking(move || resolve_private_key(&key, keychain.as_ref()))
            .await
        {
            Ok(result) => result,
            Err(e) => Err(confnode_crypto::CryptoError::Keychain(format!(
                "key resolution task failed: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confnode_crypto::ResponseOpener;
    use confnode_crypto::ohttp::{decapsulate_key, generate_keypair};

    #[tokio::test]
    async fn hpke_rewrap_is_openable_by_the_worker() {
        let (sk, pk) = generate_keypair();
        let bundle = AttestationBundle {
            release_digest: "sha256:worker".to_string(),
            ohttp_public_key: pk.to_bytes(),
            key_id: 9,
            expires_at_ms: 0,
        };
        let dek = ChunkKey::generate();
        let rewrapped = HpkeKeyRewrapper.rewrap(&bundle, &dek).await.unwrap();
        assert_eq!(rewrapped.key_id, 9);

        let opened = decapsulate_key(&rewrapped.encapsulated_key, &sk).unwrap();
        assert_eq!(opened.dek.as_bytes(), dek.as_bytes());

        let mut encapsulator = confnode_crypto::ResponseEncapsulator::new(
            &opened.response,
            confnode_crypto::ResponseMode::Standard,
        )
        .unwrap();
        let chunk = encapsulator.encapsulate(b"from worker", true).unwrap();
        let mut opener = ResponseOpener::new(rewrapped.response);
        assert_eq!(opener.open(&chunk, true).unwrap(), b"from worker");
    }

    #[tokio::test]
    async fn rewrap_rejects_bad_bundles() {
        let bundle = AttestationBundle {
            release_digest: String::new(),
            ohttp_public_key: vec![1, 2, 3],
            key_id: 1,
            expires_at_ms: 0,
        };
        assert!(
            HpkeKeyRewrapper
                .rewrap(&bundle, &ChunkKey::generate())
                .await
                .is_err()
        );
        let bundle = AttestationBundle {
            key_id: 300,
            ..bundle
        };
        assert!(
            HpkeKeyRewrapper
                .rewrap(&bundle, &ChunkKey::generate())
                .await
                .is_err()
        );
    }
}
