//! Assembles the services every job on this node shares.

use crate::config::DaemonConfig;
use crate::keys::{FileAttestationClient, refresh};
use crate::validators::{NoIssuer, ReleaseAllowlist, SignedTokenValidator};
use anyhow::{Result, bail};
use confnode_crypto::AttestedKeyStore;
use confnode_crypto::keys::DirectoryKeychain;
use confnode_job::{AttestationClient, HpkeKeyRewrapper, JobServices, TokenValidator};
use std::sync::Arc;

pub struct Node {
    pub services: JobServices,
    pub attestation: Arc<dyn AttestationClient>,
}

impl Node {
    /// Build the shared services and load the initial key set.
    pub async fn load(config: &DaemonConfig) -> Result<Self> {
        let token_validator: Arc<dyn TokenValidator> = match &config.token_issuer {
            Some(issuer) => Arc::new(SignedTokenValidator::from_hex(
                &issuer.key_id,
                &issuer.public_key,
            )?),
            None if config.enforce_token_validation => {
                bail!("token validation is enforced but no token_issuer is configured")
            }
            None => {
                tracing::warn!("no token issuer configured; tokens will fail validation");
                Arc::new(NoIssuer)
            }
        };

        let attestation: Arc<dyn AttestationClient> =
            Arc::new(FileAttestationClient::new(config.key_set_path()));
        let keys = Arc::new(AttestedKeyStore::default());
        if let Err(e) = refresh(attestation.as_ref(), &keys).await {
            tracing::warn!(err = %format!("{e:#}"), "no attested keys yet; waiting for SIGHUP");
        }

        let services = JobServices {
            token_validator,
            attestation_validator: Arc::new(ReleaseAllowlist::new(
                config.allowed_release_digests.iter().cloned(),
            )),
            key_rewrapper: Arc::new(HpkeKeyRewrapper),
            keys,
            keychain: Arc::new(DirectoryKeychain::new(config.keychain_dir())),
        };
        Ok(Self {
            services,
            attestation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenIssuerConfig;
    use confnode_crypto::token::TokenIssuer;

    #[tokio::test]
    async fn enforcement_needs_an_issuer() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            state_dir: dir.path().to_path_buf(),
            ..DaemonConfig::default()
        };
        assert!(Node::load(&config).await.is_err());

        let relaxed = DaemonConfig {
            enforce_token_validation: false,
            ..config
        };
        let node = Node::load(&relaxed).await.unwrap();
        assert!(node.services.keys.snapshot().is_empty());
    }

    #[tokio::test]
    async fn issuer_and_key_set_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(crate::config::KEY_SET_FILE),
            r#"{"current": {"key_id": 5, "source": {"kind": "keychain", "reference": "k5"}}}"#,
        )
        .unwrap();
        let issuer = TokenIssuer::generate("issuer-1");
        let config = DaemonConfig {
            state_dir: dir.path().to_path_buf(),
            token_issuer: Some(TokenIssuerConfig {
                key_id: "issuer-1".into(),
                public_key: hex::encode(issuer.public_key_sec1()),
            }),
            ..DaemonConfig::default()
        };
        let node = Node::load(&config).await.unwrap();
        assert!(node.services.keys.lookup(5, 0).is_ok());

        let token = issuer.issue(b"ott", b"salt", 0);
        assert!(
            node.services
                .token_validator
                .validate(&token, b"ott", b"salt")
                .await
                .is_ok()
        );
    }
}
