use thiserror::Error;

/// Errors raised by the OHTTP, chunk AEAD and key handling primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encapsulated request is too short: {0} bytes")]
    TruncatedEncapsulation(usize),

    #[error("unsupported key configuration: kem={kem_id:#06x} kdf={kdf_id:#06x} aead={aead_id:#06x}")]
    UnsupportedKeyConfig {
        kem_id: u16,
        kdf_id: u16,
        aead_id: u16,
    },

    #[error("invalid chunk algorithm tag {0:#06x}")]
    InvalidAlgorithmTag(u16),

    #[error("chunk is too short: {0} bytes")]
    TruncatedChunk(usize),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("HPKE operation failed: {0}")]
    Hpke(String),

    #[error("AEAD open failed")]
    OpenFailed,

    #[error("AEAD seal failed")]
    SealFailed,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("chunk counter exhausted")]
    CounterExhausted,

    #[error("unknown key id {0}")]
    UnknownKeyId(u8),

    #[error("key {key_id} expired at {expired_at_ms}")]
    ExpiredKey { key_id: u8, expired_at_ms: u64 },

    #[error("keychain error: {0}")]
    Keychain(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
