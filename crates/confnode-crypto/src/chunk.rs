//! AES-128-GCM chunk framing shared by the request and response directions.
//!
//! A stream is keyed by a 16-byte data-encryption key and a 12-byte base
//! nonce. Chunk `i` is sealed under `base_nonce XOR i` (the counter is
//! big-endian in the low 8 bytes). The last chunk of a stream uses the
//! associated data `"final"`, every other chunk uses empty associated data,
//! so truncating a stream is detectable.

use crate::error::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

pub const AEAD_KEY_BYTES: usize = 16;
pub const AEAD_NONCE_BYTES: usize = 12;
pub const AEAD_TAG_BYTES: usize = 16;

/// RFC 9180 AEAD identifier for AES-128-GCM.
pub const AEAD_ID_AES_128_GCM: u16 = 0x0001;

/// Length of the algorithm tag that opens a request stream.
pub const ALGORITHM_TAG_BYTES: usize = 2;

/// Bytes preceding the ciphertext of the first request chunk.
pub const FIRST_CHUNK_HEADER_BYTES: usize = ALGORITHM_TAG_BYTES + AEAD_NONCE_BYTES;

const FINAL_CHUNK_AAD: &[u8] = b"final";

/// Associated data for a chunk.
pub fn chunk_aad(is_final: bool) -> &'static [u8] {
    if is_final { FINAL_CHUNK_AAD } else { &[] }
}

/// XOR `counter` (big-endian) into the low 8 bytes of `base`.
pub fn chunk_nonce(base: &[u8; AEAD_NONCE_BYTES], counter: u64) -> [u8; AEAD_NONCE_BYTES] {
    let mut nonce = *base;
    for (n, c) in nonce[AEAD_NONCE_BYTES - 8..]
        .iter_mut()
        .zip(counter.to_be_bytes())
    {
        *n ^= c;
    }
    nonce
}

/// Split the first chunk of a request stream into its base nonce and
/// ciphertext, checking the algorithm tag.
pub fn split_first_chunk(chunk: &[u8]) -> Result<([u8; AEAD_NONCE_BYTES], &[u8])> {
    if chunk.len() < FIRST_CHUNK_HEADER_BYTES {
        return Err(CryptoError::TruncatedChunk(chunk.len()));
    }
    let tag = u16::from_be_bytes([chunk[0], chunk[1]]);
    if tag != AEAD_ID_AES_128_GCM {
        return Err(CryptoError::InvalidAlgorithmTag(tag));
    }
    let mut nonce = [0u8; AEAD_NONCE_BYTES];
    nonce.copy_from_slice(&chunk[ALGORITHM_TAG_BYTES..FIRST_CHUNK_HEADER_BYTES]);
    Ok((nonce, &chunk[FIRST_CHUNK_HEADER_BYTES..]))
}

/// Generate a random base nonce.
pub fn random_nonce() -> [u8; AEAD_NONCE_BYTES] {
    let mut nonce = [0u8; AEAD_NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// An AES-128-GCM key used for chunk streams.
#[derive(Clone)]
pub struct ChunkKey {
    bytes: Zeroizing<[u8; AEAD_KEY_BYTES]>,
    cipher: Aes128Gcm,
}

impl ChunkKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != AEAD_KEY_BYTES {
            return Err(CryptoError::InvalidKeyLength {
                expected: AEAD_KEY_BYTES,
                actual: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; AEAD_KEY_BYTES]);
        key.copy_from_slice(bytes);
        Ok(Self::from_array(key))
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; AEAD_KEY_BYTES]);
        OsRng.fill_bytes(&mut key[..]);
        Self::from_array(key)
    }

    fn from_array(bytes: Zeroizing<[u8; AEAD_KEY_BYTES]>) -> Self {
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&bytes[..]));
        Self { bytes, cipher }
    }

    pub fn as_bytes(&self) -> &[u8; AEAD_KEY_BYTES] {
        &self.bytes
    }

    /// Seal one chunk. The returned ciphertext has the tag appended.
    pub fn seal(
        &self,
        nonce: &[u8; AEAD_NONCE_BYTES],
        plaintext: &[u8],
        is_final: bool,
    ) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad: chunk_aad(is_final),
                },
            )
            .map_err(|_| CryptoError::SealFailed)
    }

    /// Open one chunk sealed by [`ChunkKey::seal`].
    pub fn open(
        &self,
        nonce: &[u8; AEAD_NONCE_BYTES],
        ciphertext: &[u8],
        is_final: bool,
    ) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: chunk_aad(is_final),
                },
            )
            .map_err(|_| CryptoError::OpenFailed)
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChunkKey(<redacted>)")
    }
}

/// Produces a request stream: the first chunk carries the algorithm tag and
/// base nonce, later chunks carry ciphertext only.
pub struct ChunkSealer {
    key: ChunkKey,
    base_nonce: [u8; AEAD_NONCE_BYTES],
    counter: u64,
}

impl ChunkSealer {
    pub fn new(key: ChunkKey) -> Self {
        Self::with_nonce(key, random_nonce())
    }

    pub fn with_nonce(key: ChunkKey, base_nonce: [u8; AEAD_NONCE_BYTES]) -> Self {
        Self {
            key,
            base_nonce,
            counter: 0,
        }
    }

    /// Number of chunks sealed so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn seal(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>> {
        let nonce = chunk_nonce(&self.base_nonce, self.counter);
        let ciphertext = self.key.seal(&nonce, plaintext, is_final)?;
        let chunk = if self.counter == 0 {
            let mut out = Vec::with_capacity(FIRST_CHUNK_HEADER_BYTES + ciphertext.len());
            out.extend_from_slice(&AEAD_ID_AES_128_GCM.to_be_bytes());
            out.extend_from_slice(&self.base_nonce);
            out.extend_from_slice(&ciphertext);
            out
        } else {
            ciphertext
        };
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_xors_counter_into_low_bytes() {
        let base = [0xAAu8; AEAD_NONCE_BYTES];
        assert_eq!(chunk_nonce(&base, 0), base);

        let nonce = chunk_nonce(&base, 1);
        assert_eq!(&nonce[..11], &base[..11]);
        assert_eq!(nonce[11], 0xAB);

        let nonce = chunk_nonce(&base, 0x0102);
        assert_eq!(nonce[10], 0xAA ^ 0x01);
        assert_eq!(nonce[11], 0xAA ^ 0x02);
        // The high 4 bytes are never touched.
        let nonce = chunk_nonce(&base, u64::MAX);
        assert_eq!(&nonce[..4], &base[..4]);
        assert!(nonce[4..].iter().all(|b| *b == 0x55));
    }

    #[test]
    fn final_aad_is_bound() {
        let key = ChunkKey::generate();
        let nonce = random_nonce();
        let sealed = key.seal(&nonce, b"last", true).unwrap();
        assert_eq!(sealed.len(), 4 + AEAD_TAG_BYTES);
        assert_eq!(key.open(&nonce, &sealed, true).unwrap(), b"last");
        assert_eq!(
            key.open(&nonce, &sealed, false),
            Err(CryptoError::OpenFailed)
        );
    }

    #[test]
    fn sealer_prefixes_only_first_chunk() {
        let key = ChunkKey::generate();
        let base = random_nonce();
        let mut sealer = ChunkSealer::with_nonce(key.clone(), base);

        let first = sealer.seal(b"one", false).unwrap();
        let second = sealer.seal(b"two", true).unwrap();
        assert_eq!(sealer.counter(), 2);

        let (nonce, body) = split_first_chunk(&first).unwrap();
        assert_eq!(nonce, base);
        assert_eq!(key.open(&chunk_nonce(&base, 0), body, false).unwrap(), b"one");
        assert_eq!(second.len(), 3 + AEAD_TAG_BYTES);
        assert_eq!(
            key.open(&chunk_nonce(&base, 1), &second, true).unwrap(),
            b"two"
        );
    }

    #[test]
    fn first_chunk_rejects_wrong_tag() {
        let mut chunk = vec![0x00, 0x02];
        chunk.extend_from_slice(&[0u8; AEAD_NONCE_BYTES]);
        assert_eq!(
            split_first_chunk(&chunk).unwrap_err(),
            CryptoError::InvalidAlgorithmTag(2)
        );
        assert_eq!(
            split_first_chunk(&[0x00, 0x01, 0x02]).unwrap_err(),
            CryptoError::TruncatedChunk(3)
        );
    }

    #[test]
    fn key_length_is_checked() {
        assert!(matches!(
            ChunkKey::from_slice(&[0u8; 32]),
            Err(CryptoError::InvalidKeyLength {
                expected: 16,
                actual: 32
            })
        ));
    }
}
