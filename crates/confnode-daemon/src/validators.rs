//! Policy validators the daemon plugs into every job.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use confnode_crypto::time::{is_expired, now_ms};
use confnode_crypto::token::TokenVerifier;
use confnode_crypto::AttestedKey;
use confnode_job::{AttestationValidator, TokenValidator};
use confnode_proto::app::v1::AttestationBundle;
use prost::Message;
use std::collections::BTreeSet;

/// Verifies issuer-signed token-granting tokens.
#[derive(Debug, Clone)]
pub struct SignedTokenValidator {
    verifier: TokenVerifier,
}

impl SignedTokenValidator {
    pub fn new(verifier: TokenVerifier) -> Self {
        Self { verifier }
    }

    /// Build from a key id and a hex-encoded SEC1 public key.
    pub fn from_hex(key_id: &str, public_key_hex: &str) -> Result<Self> {
        let public_key = hex::decode(public_key_hex).context("issuer public key is not hex")?;
        Ok(Self::new(TokenVerifier::from_sec1(key_id, &public_key)?))
    }
}

#[async_trait]
impl TokenValidator for SignedTokenValidator {
    async fn validate(
        &self,
        token_granting_token: &[u8],
        one_time_token: &[u8],
        salt: &[u8],
    ) -> Result<()> {
        self.verifier
            .verify(token_granting_token, one_time_token, salt, now_ms())?;
        Ok(())
    }
}

/// Rejects every token. Used when no issuer is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIssuer;

#[async_trait]
impl TokenValidator for NoIssuer {
    async fn validate(&self, _: &[u8], _: &[u8], _: &[u8]) -> Result<()> {
        bail!("no token issuer configured")
    }
}

/// Accepts a worker whose attestation bundle names an allowed release.
///
/// This is the policy boundary only: the bundle is trusted to have been
/// produced by the attestation verifier in front of the routing layer.
#[derive(Debug, Clone, Default)]
pub struct ReleaseAllowlist {
    allowed: BTreeSet<String>,
}

impl ReleaseAllowlist {
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AttestationValidator for ReleaseAllowlist {
    async fn validate(
        &self,
        attestation: &[u8],
        addressed: &AttestedKey,
    ) -> Result<AttestationBundle> {
        let bundle =
            AttestationBundle::decode(attestation).context("malformed attestation bundle")?;
        if is_expired(bundle.expires_at_ms, now_ms()) {
            bail!("attestation expired at {}", bundle.expires_at_ms);
        }
        let allowed = if self.allowed.is_empty() {
            bundle.release_digest == addressed.release_digest
        } else {
            self.allowed.contains(&bundle.release_digest)
        };
        if !allowed {
            bail!(
                "release {} not allowed for requests addressed to key {}",
                bundle.release_digest,
                addressed.key_id
            );
        }
        tracing::debug!(
            release_digest = %bundle.release_digest,
            worker_key_id = bundle.key_id,
            public_key = %hex::encode(&bundle.ohttp_public_key),
            "worker attestation accepted"
        );
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confnode_crypto::PrivateKeySource;
    use confnode_crypto::token::TokenIssuer;

    fn addressed(release_digest: &str) -> AttestedKey {
        AttestedKey {
            key_id: 1,
            expires_at_ms: 0,
            release_digest: release_digest.to_string(),
            source: PrivateKeySource::Keychain {
                reference: "node".to_string(),
            },
        }
    }

    fn bundle(release_digest: &str, expires_at_ms: u64) -> Vec<u8> {
        AttestationBundle {
            release_digest: release_digest.to_string(),
            ohttp_public_key: vec![7; 32],
            key_id: 2,
            expires_at_ms,
        }
        .encode_to_vec()
    }

    #[tokio::test]
    async fn empty_allowlist_means_same_release() {
        let policy = ReleaseAllowlist::default();
        let node = addressed("sha256:aa");
        assert!(policy.validate(&bundle("sha256:aa", 0), &node).await.is_ok());
        assert!(policy.validate(&bundle("sha256:bb", 0), &node).await.is_err());
    }

    #[tokio::test]
    async fn allowlist_and_expiry() {
        let policy = ReleaseAllowlist::new(["sha256:bb".to_string()]);
        let node = addressed("sha256:aa");
        let accepted = policy.validate(&bundle("sha256:bb", 0), &node).await.unwrap();
        assert_eq!(accepted.key_id, 2);
        assert!(policy.validate(&bundle("sha256:aa", 0), &node).await.is_err());
        assert!(policy.validate(&bundle("sha256:bb", 1), &node).await.is_err());
        assert!(policy.validate(b"\xff", &node).await.is_err());
    }

    #[tokio::test]
    async fn signed_tokens() {
        let issuer = TokenIssuer::generate("issuer-1");
        let validator =
            SignedTokenValidator::from_hex("issuer-1", &hex::encode(issuer.public_key_sec1()))
                .unwrap();
        let token = issuer.issue(b"ott", b"salt", 0);
        assert!(validator.validate(&token, b"ott", b"salt").await.is_ok());
        assert!(validator.validate(&token, b"other", b"salt").await.is_err());
        assert!(NoIssuer.validate(&token, b"ott", b"salt").await.is_err());
        assert!(SignedTokenValidator::from_hex("issuer-1", "zz").is_err());
    }
}
