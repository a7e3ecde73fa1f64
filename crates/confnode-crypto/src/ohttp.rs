//! Oblivious HTTP (RFC 9458) key encapsulation with chunked responses.
//!
//! The client wraps a 16-byte data-encryption key (DEK) in an encapsulated
//! request addressed to one of the node's attested HPKE keys:
//!
//! ```text
//! key_id (1) | kem_id (2) | kdf_id (2) | aead_id (2) | enc (32) | HPKE ciphertext
//! ```
//!
//! The HPKE context set up for that request also keys the response stream:
//! a secret is exported from it and combined with a response nonce through
//! HKDF to produce the response AEAD key and base nonce.

use crate::chunk::{
    AEAD_ID_AES_128_GCM, AEAD_KEY_BYTES, AEAD_NONCE_BYTES, ChunkKey, chunk_nonce,
};
use crate::error::{CryptoError, Result};
use hkdf::Hkdf;
use hpke::aead::AesGcm128;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem as KemTrait, OpModeR, OpModeS, Serializable};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

type Kem = X25519HkdfSha256;

/// RFC 9180 KEM identifier for DHKEM(X25519, HKDF-SHA256).
pub const KEM_ID_X25519_SHA256: u16 = 0x0020;
/// RFC 9180 KDF identifier for HKDF-SHA256.
pub const KDF_ID_HKDF_SHA256: u16 = 0x0001;

pub const HEADER_BYTES: usize = 7;
pub const ENCAPSULATED_KEY_BYTES: usize = 32;
pub const PUBLIC_KEY_BYTES: usize = 32;
pub const PRIVATE_KEY_BYTES: usize = 32;

/// Response nonce length: `max(Nn, Nk)` for AES-128-GCM.
pub const RESPONSE_NONCE_BYTES: usize = 16;

/// Response nonce used by the forced-state encapsulator. Every HPKE context
/// is used for exactly one response stream, so a fixed value is single-use.
pub const BYPASS_RESPONSE_NONCE: [u8; RESPONSE_NONCE_BYTES] = [0u8; RESPONSE_NONCE_BYTES];

const REQUEST_LABEL: &[u8] = b"message/bhttp chunked request";
const RESPONSE_LABEL: &[u8] = b"message/bhttp chunked response";

/// The key-configuration header that opens an encapsulated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyConfigHeader {
    pub key_id: u8,
    pub kem_id: u16,
    pub kdf_id: u16,
    pub aead_id: u16,
}

impl KeyConfigHeader {
    /// Header for the only ciphersuite this node speaks.
    pub fn new(key_id: u8) -> Self {
        Self {
            key_id,
            kem_id: KEM_ID_X25519_SHA256,
            kdf_id: KDF_ID_HKDF_SHA256,
            aead_id: AEAD_ID_AES_128_GCM,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(CryptoError::TruncatedEncapsulation(bytes.len()));
        }
        let header = Self {
            key_id: bytes[0],
            kem_id: u16::from_be_bytes([bytes[1], bytes[2]]),
            kdf_id: u16::from_be_bytes([bytes[3], bytes[4]]),
            aead_id: u16::from_be_bytes([bytes[5], bytes[6]]),
        };
        if header.kem_id != KEM_ID_X25519_SHA256
            || header.kdf_id != KDF_ID_HKDF_SHA256
            || header.aead_id != AEAD_ID_AES_128_GCM
        {
            return Err(CryptoError::UnsupportedKeyConfig {
                kem_id: header.kem_id,
                kdf_id: header.kdf_id,
                aead_id: header.aead_id,
            });
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let mut out = [0u8; HEADER_BYTES];
        out[0] = self.key_id;
        out[1..3].copy_from_slice(&self.kem_id.to_be_bytes());
        out[3..5].copy_from_slice(&self.kdf_id.to_be_bytes());
        out[5..7].copy_from_slice(&self.aead_id.to_be_bytes());
        out
    }

    fn request_info(&self) -> Vec<u8> {
        let mut info = Vec::with_capacity(REQUEST_LABEL.len() + 1 + HEADER_BYTES);
        info.extend_from_slice(REQUEST_LABEL);
        info.push(0);
        info.extend_from_slice(&self.to_bytes());
        info
    }
}

/// Read only the key id of an encapsulated request, without validating it.
pub fn peek_key_id(encapsulated: &[u8]) -> Result<u8> {
    encapsulated
        .first()
        .copied()
        .ok_or(CryptoError::TruncatedEncapsulation(0))
}

/// An X25519 HPKE private key.
#[derive(Clone)]
pub struct PrivateKey(<Kem as KemTrait>::PrivateKey);

/// An X25519 HPKE public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(<Kem as KemTrait>::PublicKey);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_BYTES {
            return Err(CryptoError::InvalidKeyLength {
                expected: PRIVATE_KEY_BYTES,
                actual: bytes.len(),
            });
        }
        <Kem as KemTrait>::PrivateKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| CryptoError::Hpke(e.to_string()))
    }

    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.0.to_bytes().to_vec())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_BYTES {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_BYTES,
                actual: bytes.len(),
            });
        }
        <Kem as KemTrait>::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| CryptoError::Hpke(e.to_string()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// Generate a fresh HPKE key pair.
pub fn generate_keypair() -> (PrivateKey, PublicKey) {
    let (sk, pk) = Kem::gen_keypair(&mut OsRng);
    (PrivateKey(sk), PublicKey(pk))
}

/// The secret exported from a request's HPKE context, from which the
/// response stream keys are derived.
#[derive(Clone)]
pub struct ResponseSecret {
    enc: [u8; ENCAPSULATED_KEY_BYTES],
    secret: Zeroizing<[u8; AEAD_KEY_BYTES]>,
}

impl ResponseSecret {
    fn from_parts(enc: &[u8], secret: Zeroizing<[u8; AEAD_KEY_BYTES]>) -> Self {
        let mut enc_bytes = [0u8; ENCAPSULATED_KEY_BYTES];
        enc_bytes.copy_from_slice(enc);
        Self {
            enc: enc_bytes,
            secret,
        }
    }

    /// Derive the response key and base nonce for a given response nonce.
    pub fn key_material(
        &self,
        response_nonce: &[u8; RESPONSE_NONCE_BYTES],
    ) -> Result<ResponseKeyMaterial> {
        let mut salt = Vec::with_capacity(ENCAPSULATED_KEY_BYTES + RESPONSE_NONCE_BYTES);
        salt.extend_from_slice(&self.enc);
        salt.extend_from_slice(response_nonce);
        let prk = Hkdf::<Sha256>::new(Some(&salt), &self.secret[..]);

        let mut key = Zeroizing::new([0u8; AEAD_KEY_BYTES]);
        prk.expand(b"key", &mut key[..])
            .map_err(|_| CryptoError::KeyDerivation)?;
        let mut nonce = [0u8; AEAD_NONCE_BYTES];
        prk.expand(b"nonce", &mut nonce)
            .map_err(|_| CryptoError::KeyDerivation)?;

        Ok(ResponseKeyMaterial {
            key: ChunkKey::from_slice(&key[..])?,
            nonce,
        })
    }

    /// Key material a forced-state (response bypass) stream is sealed with.
    pub fn bypass_key_material(&self) -> Result<ResponseKeyMaterial> {
        self.key_material(&BYPASS_RESPONSE_NONCE)
    }
}

impl fmt::Debug for ResponseSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseSecret(<redacted>)")
    }
}

/// AEAD key and base nonce for one response stream.
#[derive(Debug, Clone)]
pub struct ResponseKeyMaterial {
    pub key: ChunkKey,
    pub nonce: [u8; AEAD_NONCE_BYTES],
}

/// Result of opening an encapsulated key request.
#[derive(Debug)]
pub struct DecapsulatedKey {
    pub header: KeyConfigHeader,
    pub dek: ChunkKey,
    pub response: ResponseSecret,
}

/// Open an encapsulated request and recover the data-encryption key.
pub fn decapsulate_key(encapsulated: &[u8], private_key: &PrivateKey) -> Result<DecapsulatedKey> {
    let header = KeyConfigHeader::parse(encapsulated)?;
    let body = &encapsulated[HEADER_BYTES..];
    if body.len() < ENCAPSULATED_KEY_BYTES {
        return Err(CryptoError::TruncatedEncapsulation(encapsulated.len()));
    }
    let (enc, ciphertext) = body.split_at(ENCAPSULATED_KEY_BYTES);
    let encapped = <Kem as KemTrait>::EncappedKey::from_bytes(enc)
        .map_err(|e| CryptoError::Hpke(e.to_string()))?;

    let mut ctx = hpke::setup_receiver::<AesGcm128, HkdfSha256, Kem>(
        &OpModeR::Base,
        &private_key.0,
        &encapped,
        &header.request_info(),
    )
    .map_err(|e| CryptoError::Hpke(e.to_string()))?;

    let dek = Zeroizing::new(
        ctx.open(ciphertext, &[])
            .map_err(|_| CryptoError::OpenFailed)?,
    );
    let mut secret = Zeroizing::new([0u8; AEAD_KEY_BYTES]);
    ctx.export(RESPONSE_LABEL, &mut secret[..])
        .map_err(|e| CryptoError::Hpke(e.to_string()))?;
    let response = ResponseSecret::from_parts(enc, secret);

    Ok(DecapsulatedKey {
        header,
        dek: ChunkKey::from_slice(&dek)?,
        response,
    })
}

/// Wrap `dek` for the holder of `public_key`. Returns the encapsulated
/// request and the secret needed to open (or predict) its response stream.
pub fn encapsulate_key(
    public_key: &PublicKey,
    key_id: u8,
    dek: &ChunkKey,
) -> Result<(Vec<u8>, ResponseSecret)> {
    let header = KeyConfigHeader::new(key_id);
    let (encapped, mut ctx) = hpke::setup_sender::<AesGcm128, HkdfSha256, Kem, _>(
        &OpModeS::Base,
        &public_key.0,
        &header.request_info(),
        &mut OsRng,
    )
    .map_err(|e| CryptoError::Hpke(e.to_string()))?;

    let ciphertext = ctx
        .seal(dek.as_bytes(), &[])
        .map_err(|_| CryptoError::SealFailed)?;
    let enc = encapped.to_bytes();
    let mut secret = Zeroizing::new([0u8; AEAD_KEY_BYTES]);
    ctx.export(RESPONSE_LABEL, &mut secret[..])
        .map_err(|e| CryptoError::Hpke(e.to_string()))?;
    let response = ResponseSecret::from_parts(&enc, secret);

    let mut out = Vec::with_capacity(HEADER_BYTES + enc.len() + ciphertext.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&enc);
    out.extend_from_slice(&ciphertext);
    Ok((out, response))
}

/// How a node seals its response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Random response nonce; only the original requester can decrypt.
    Standard,
    /// Fixed response nonce; decryptable by anyone handed the key material
    /// out-of-band.
    ForcedState,
}

/// Seals a chunked response stream. The first chunk is prefixed with the
/// response nonce.
pub struct ResponseEncapsulator {
    mode: ResponseMode,
    response_nonce: [u8; RESPONSE_NONCE_BYTES],
    material: ResponseKeyMaterial,
    counter: u64,
}

impl ResponseEncapsulator {
    pub fn new(secret: &ResponseSecret, mode: ResponseMode) -> Result<Self> {
        let response_nonce = match mode {
            ResponseMode::Standard => {
                let mut nonce = [0u8; RESPONSE_NONCE_BYTES];
                OsRng.fill_bytes(&mut nonce);
                nonce
            }
            ResponseMode::ForcedState => BYPASS_RESPONSE_NONCE,
        };
        let material = secret.key_material(&response_nonce)?;
        Ok(Self {
            mode,
            response_nonce,
            material,
            counter: 0,
        })
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    /// Number of chunks sealed so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn encapsulate(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>> {
        let nonce = chunk_nonce(&self.material.nonce, self.counter);
        let sealed = self.material.key.seal(&nonce, plaintext, is_final)?;
        let chunk = if self.counter == 0 {
            let mut out = Vec::with_capacity(RESPONSE_NONCE_BYTES + sealed.len());
            out.extend_from_slice(&self.response_nonce);
            out.extend_from_slice(&sealed);
            out
        } else {
            sealed
        };
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        Ok(chunk)
    }
}

impl fmt::Debug for ResponseEncapsulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseEncapsulator")
            .field("mode", &self.mode)
            .field("counter", &self.counter)
            .finish()
    }
}

/// Opens a chunked response stream produced by [`ResponseEncapsulator`].
pub struct ResponseOpener {
    secret: Option<ResponseSecret>,
    material: Option<ResponseKeyMaterial>,
    counter: u64,
}

impl ResponseOpener {
    /// Open a stream keyed from the requester's own HPKE context.
    pub fn new(secret: ResponseSecret) -> Self {
        Self {
            secret: Some(secret),
            material: None,
            counter: 0,
        }
    }

    /// Open a stream with key material handed over out-of-band. The leading
    /// response nonce is skipped rather than used for derivation.
    pub fn with_key_material(material: ResponseKeyMaterial) -> Self {
        Self {
            secret: None,
            material: Some(material),
            counter: 0,
        }
    }

    pub fn open(&mut self, chunk: &[u8], is_final: bool) -> Result<Vec<u8>> {
        let ciphertext = if self.counter == 0 {
            if chunk.len() < RESPONSE_NONCE_BYTES {
                return Err(CryptoError::TruncatedChunk(chunk.len()));
            }
            let (nonce_bytes, rest) = chunk.split_at(RESPONSE_NONCE_BYTES);
            if let Some(secret) = &self.secret {
                let mut response_nonce = [0u8; RESPONSE_NONCE_BYTES];
                response_nonce.copy_from_slice(nonce_bytes);
                self.material = Some(secret.key_material(&response_nonce)?);
            }
            rest
        } else {
            chunk
        };
        let material = self.material.as_ref().ok_or(CryptoError::OpenFailed)?;
        let plaintext = material.key.open(
            &chunk_nonce(&material.nonce, self.counter),
            ciphertext,
            is_final,
        )?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_and_validation() {
        let header = KeyConfigHeader::new(7);
        assert_eq!(KeyConfigHeader::parse(&header.to_bytes()).unwrap(), header);

        let mut bad = header.to_bytes();
        bad[6] = 0x02;
        assert!(matches!(
            KeyConfigHeader::parse(&bad),
            Err(CryptoError::UnsupportedKeyConfig { aead_id: 2, .. })
        ));
        assert_eq!(
            KeyConfigHeader::parse(&[1, 0, 0x20]).unwrap_err(),
            CryptoError::TruncatedEncapsulation(3)
        );
    }

    #[test]
    fn decapsulation_recovers_dek() {
        let (sk, pk) = generate_keypair();
        let dek = ChunkKey::generate();
        let (encapsulated, _) = encapsulate_key(&pk, 3, &dek).unwrap();
        assert_eq!(peek_key_id(&encapsulated).unwrap(), 3);

        let opened = decapsulate_key(&encapsulated, &sk).unwrap();
        assert_eq!(opened.header.key_id, 3);
        assert_eq!(opened.dek.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn decapsulation_with_wrong_key_fails() {
        let (_, pk) = generate_keypair();
        let (other_sk, _) = generate_keypair();
        let (encapsulated, _) = encapsulate_key(&pk, 1, &ChunkKey::generate()).unwrap();
        assert_eq!(
            decapsulate_key(&encapsulated, &other_sk).unwrap_err(),
            CryptoError::OpenFailed
        );
    }

    #[test]
    fn tampered_header_fails_open() {
        let (sk, pk) = generate_keypair();
        let (mut encapsulated, _) = encapsulate_key(&pk, 1, &ChunkKey::generate()).unwrap();
        // The header is bound into the HPKE info string.
        encapsulated[0] = 2;
        assert_eq!(
            decapsulate_key(&encapsulated, &sk).unwrap_err(),
            CryptoError::OpenFailed
        );
    }

    #[test]
    fn standard_response_round_trip() {
        let (sk, pk) = generate_keypair();
        let (encapsulated, client_secret) =
            encapsulate_key(&pk, 1, &ChunkKey::generate()).unwrap();
        let opened = decapsulate_key(&encapsulated, &sk).unwrap();

        let mut encapsulator =
            ResponseEncapsulator::new(&opened.response, ResponseMode::Standard).unwrap();
        let first = encapsulator.encapsulate(b"hello", false).unwrap();
        let second = encapsulator.encapsulate(b"world", true).unwrap();
        assert_eq!(encapsulator.counter(), 2);

        let mut opener = ResponseOpener::new(client_secret);
        assert_eq!(opener.open(&first, false).unwrap(), b"hello");
        assert_eq!(opener.open(&second, true).unwrap(), b"world");
    }

    #[test]
    fn forced_state_response_opens_with_handed_over_material() {
        let (sk, pk) = generate_keypair();
        let (encapsulated, sender_secret) =
            encapsulate_key(&pk, 1, &ChunkKey::generate()).unwrap();
        let opened = decapsulate_key(&encapsulated, &sk).unwrap();

        let mut encapsulator =
            ResponseEncapsulator::new(&opened.response, ResponseMode::ForcedState).unwrap();
        let first = encapsulator.encapsulate(b"direct", true).unwrap();
        assert_eq!(&first[..RESPONSE_NONCE_BYTES], &BYPASS_RESPONSE_NONCE);

        // A third party only knows the key and nonce the sender predicted.
        let material = sender_secret.bypass_key_material().unwrap();
        let mut opener = ResponseOpener::with_key_material(material);
        assert_eq!(opener.open(&first, true).unwrap(), b"direct");
    }

    #[test]
    fn response_chunks_are_order_bound() {
        let (sk, pk) = generate_keypair();
        let (encapsulated, client_secret) =
            encapsulate_key(&pk, 1, &ChunkKey::generate()).unwrap();
        let opened = decapsulate_key(&encapsulated, &sk).unwrap();
        let mut encapsulator =
            ResponseEncapsulator::new(&opened.response, ResponseMode::Standard).unwrap();
        let first = encapsulator.encapsulate(b"a", false).unwrap();
        let _second = encapsulator.encapsulate(b"b", false).unwrap();
        let third = encapsulator.encapsulate(b"c", true).unwrap();

        let mut opener = ResponseOpener::new(client_secret);
        opener.open(&first, false).unwrap();
        assert_eq!(opener.open(&third, true).unwrap_err(), CryptoError::OpenFailed);
    }
}
