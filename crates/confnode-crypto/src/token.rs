//! Token-granting tokens.
//!
//! A token-granting token (TGT) is issued against a one-time token (OTT)
//! without learning it: the issuer signs a commitment `SHA-256(salt || ott)`
//! and the client later presents the TGT together with the salt. The node
//! recomputes the commitment from the OTT it received in the request
//! parameters.

use crate::error::{CryptoError, Result};
use crate::time::is_expired;
use confnode_proto::app::v1::{TokenGrantingToken, TokenGrantingTokenBody};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::PublicKey;
use prost::Message;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub const OTT_COMMITMENT_BYTES: usize = 32;

/// `SHA-256(salt || ott)`.
pub fn ott_commitment(salt: &[u8], one_time_token: &[u8]) -> [u8; OTT_COMMITMENT_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(one_time_token);
    hasher.finalize().into()
}

/// Signs token-granting tokens. Used by tests and tooling; nodes only verify.
pub struct TokenIssuer {
    key_id: String,
    signing_key: SigningKey,
}

impl TokenIssuer {
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(key_id: impl Into<String>, secret: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_slice(secret)
            .map_err(|e| CryptoError::InvalidToken(format!("invalid issuer key: {e}")))?;
        Ok(Self {
            key_id: key_id.into(),
            signing_key,
        })
    }

    /// SEC1-encoded issuer public key.
    pub fn public_key_sec1(&self) -> Vec<u8> {
        PublicKey::from(self.signing_key.verifying_key())
            .to_sec1_bytes()
            .to_vec()
    }

    pub fn issue(&self, one_time_token: &[u8], salt: &[u8], expires_at_ms: u64) -> Vec<u8> {
        let body = TokenGrantingTokenBody {
            key_id: self.key_id.clone(),
            ott_commitment: ott_commitment(salt, one_time_token).to_vec(),
            expires_at_ms,
        }
        .encode_to_vec();
        let signature: Signature = self.signing_key.sign(&body);
        TokenGrantingToken {
            body,
            signature: signature.to_der().as_bytes().to_vec(),
        }
        .encode_to_vec()
    }
}

/// Verifies token-granting tokens against one issuer key.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    key_id: String,
    verifying_key: VerifyingKey,
}

impl TokenVerifier {
    pub fn from_sec1(key_id: impl Into<String>, public_key: &[u8]) -> Result<Self> {
        let public_key = PublicKey::from_sec1_bytes(public_key)
            .map_err(|e| CryptoError::InvalidToken(format!("invalid issuer public key: {e}")))?;
        Ok(Self {
            key_id: key_id.into(),
            verifying_key: VerifyingKey::from(public_key),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Check signature, issuer, expiry and the OTT commitment.
    pub fn verify(
        &self,
        token: &[u8],
        one_time_token: &[u8],
        salt: &[u8],
        now_ms: u64,
    ) -> Result<TokenGrantingTokenBody> {
        let token = TokenGrantingToken::decode(token)
            .map_err(|e| CryptoError::InvalidToken(format!("malformed token: {e}")))?;
        let signature = Signature::from_der(&token.signature)
            .map_err(|_| CryptoError::InvalidToken("malformed signature".to_string()))?;
        self.verifying_key
            .verify(&token.body, &signature)
            .map_err(|_| CryptoError::InvalidToken("bad signature".to_string()))?;

        let body = TokenGrantingTokenBody::decode(token.body.as_slice())
            .map_err(|e| CryptoError::InvalidToken(format!("malformed token body: {e}")))?;
        if body.key_id != self.key_id {
            return Err(CryptoError::InvalidToken(format!(
                "unexpected issuer key {}",
                body.key_id
            )));
        }
        if is_expired(body.expires_at_ms, now_ms) {
            return Err(CryptoError::InvalidToken("token expired".to_string()));
        }
        if body.ott_commitment != ott_commitment(salt, one_time_token) {
            return Err(CryptoError::InvalidToken(
                "one-time token does not match commitment".to_string(),
            ));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (TokenIssuer, TokenVerifier) {
        let issuer = TokenIssuer::generate("issuer-1");
        let verifier = TokenVerifier::from_sec1("issuer-1", &issuer.public_key_sec1()).unwrap();
        (issuer, verifier)
    }

    #[test]
    fn issued_token_verifies() {
        let (issuer, verifier) = pair();
        let token = issuer.issue(b"ott", b"salt", 2_000);
        let body = verifier.verify(&token, b"ott", b"salt", 1_000).unwrap();
        assert_eq!(body.key_id, "issuer-1");
        assert_eq!(body.expires_at_ms, 2_000);
    }

    #[test]
    fn wrong_ott_or_salt_is_rejected() {
        let (issuer, verifier) = pair();
        let token = issuer.issue(b"ott", b"salt", 0);
        assert!(verifier.verify(&token, b"other", b"salt", 0).is_err());
        assert!(verifier.verify(&token, b"ott", b"pepper", 0).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let (issuer, verifier) = pair();
        let token = issuer.issue(b"ott", b"salt", 1_000);
        assert_eq!(
            verifier.verify(&token, b"ott", b"salt", 1_000).unwrap_err(),
            CryptoError::InvalidToken("token expired".to_string())
        );
    }

    #[test]
    fn foreign_issuer_is_rejected() {
        let (_, verifier) = pair();
        let other = TokenIssuer::generate("issuer-1");
        let token = other.issue(b"ott", b"salt", 0);
        assert_eq!(
            verifier.verify(&token, b"ott", b"salt", 0).unwrap_err(),
            CryptoError::InvalidToken("bad signature".to_string())
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let (_, verifier) = pair();
        assert!(matches!(
            verifier.verify(b"\xff\xff", b"ott", b"salt", 0),
            Err(CryptoError::InvalidToken(_))
        ));
    }
}
