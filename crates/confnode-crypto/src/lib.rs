pub mod chunk;
pub mod error;
pub mod keys;
pub mod ohttp;
pub mod time;
pub mod token;

pub use chunk::{ChunkKey, ChunkSealer};
pub use error::{CryptoError, Result};
pub use keys::{AttestedKey, AttestedKeySet, AttestedKeyStore, Keychain, PrivateKeySource};
pub use ohttp::{
    DecapsulatedKey, PrivateKey, PublicKey, ResponseEncapsulator, ResponseKeyMaterial,
    ResponseMode, ResponseOpener, ResponseSecret,
};
