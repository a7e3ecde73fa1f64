//! Server side of the encrypted request/response tunnel.
//!
//! Request chunks may arrive before the request key: they are buffered and
//! replayed once the key is established. Chunk `i` of the request, counted
//! from zero regardless of when the key arrived, is opened under
//! `base_nonce XOR i`.

use crate::error::{JobError, Result};
use confnode_crypto::chunk::{AEAD_NONCE_BYTES, chunk_nonce, split_first_chunk};
use confnode_crypto::ohttp::{DecapsulatedKey, decapsulate_key};
use confnode_crypto::{
    ChunkKey, CryptoError, PrivateKey, ResponseEncapsulator, ResponseMode, ResponseSecret,
};

/// A request chunk after decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedChunk {
    pub data: Vec<u8>,
    pub is_final: bool,
}

/// Everything the job needs once the request key is established.
#[derive(Debug)]
pub struct Handshake {
    pub key_id: u8,
    /// Chunks that arrived before the key, decrypted, in arrival order.
    pub chunks: Vec<DecryptedChunk>,
    pub dek: ChunkKey,
    pub response_secret: ResponseSecret,
    pub encapsulator: ResponseEncapsulator,
}

#[derive(Debug)]
enum TransportState {
    AwaitingKey {
        buffered: Vec<(Vec<u8>, bool)>,
    },
    KeyEstablished {
        key: ChunkKey,
    },
    Established {
        key: ChunkKey,
        base_nonce: [u8; AEAD_NONCE_BYTES],
        counter: u64,
    },
}

#[derive(Debug)]
pub struct TransportCipher {
    state: TransportState,
}

impl TransportCipher {
    pub fn new() -> Self {
        Self {
            state: TransportState::AwaitingKey {
                buffered: Vec::new(),
            },
        }
    }

    pub fn is_key_established(&self) -> bool {
        !matches!(self.state, TransportState::AwaitingKey { .. })
    }

    /// Number of chunks opened so far.
    pub fn counter(&self) -> u64 {
        match &self.state {
            TransportState::AwaitingKey { .. } | TransportState::KeyEstablished { .. } => 0,
            TransportState::Established { counter, .. } => *counter,
        }
    }

    /// Accept one encrypted request chunk. Returns the plaintext once the key
    /// is known; before that the chunk is buffered and `None` is returned.
    pub fn receive_chunk(&mut self, data: &[u8], is_final: bool) -> Result<Option<Vec<u8>>> {
        match &mut self.state {
            TransportState::AwaitingKey { buffered } => {
                buffered.push((data.to_vec(), is_final));
                Ok(None)
            }
            TransportState::KeyEstablished { key } => {
                let (base_nonce, ciphertext) = split_first_chunk(data)?;
                let plaintext = key.open(&chunk_nonce(&base_nonce, 0), ciphertext, is_final)?;
                let key = key.clone();
                self.state = TransportState::Established {
                    key,
                    base_nonce,
                    counter: 1,
                };
                Ok(Some(plaintext))
            }
            TransportState::Established {
                key,
                base_nonce,
                counter,
            } => {
                let plaintext = key.open(&chunk_nonce(base_nonce, *counter), data, is_final)?;
                *counter = counter.checked_add(1).ok_or(CryptoError::CounterExhausted)?;
                Ok(Some(plaintext))
            }
        }
    }

    /// Open the encapsulated request key and replay any buffered chunks.
    pub fn receive_key(
        &mut self,
        encapsulated_key: &[u8],
        private_key: &PrivateKey,
        mode: ResponseMode,
    ) -> Result<Handshake> {
        let TransportState::AwaitingKey { buffered } = &mut self.state else {
            return Err(JobError::ReceivedKeyTwice);
        };
        let DecapsulatedKey {
            header,
            dek,
            response,
        } = decapsulate_key(encapsulated_key, private_key)?;
        let encapsulator = ResponseEncapsulator::new(&response, mode)?;

        let buffered = std::mem::take(buffered);
        self.state = TransportState::KeyEstablished { key: dek.clone() };

        let mut chunks = Vec::with_capacity(buffered.len());
        for (data, is_final) in buffered {
            if let Some(plaintext) = self.receive_chunk(&data, is_final)? {
                chunks.push(DecryptedChunk {
                    data: plaintext,
                    is_final,
                });
            }
        }

        Ok(Handshake {
            key_id: header.key_id,
            chunks,
            dek,
            response_secret: response,
            encapsulator,
        })
    }
}

impl Default for TransportCipher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confnode_crypto::ChunkSealer;
    use confnode_crypto::chunk::random_nonce;
    use confnode_crypto::ohttp::{encapsulate_key, generate_keypair};
    use confnode_crypto::{PublicKey, ResponseOpener};

    struct Client {
        encapsulated: Vec<u8>,
        secret: ResponseSecret,
        sealer: ChunkSealer,
        dek: ChunkKey,
        base_nonce: [u8; AEAD_NONCE_BYTES],
    }

    fn client(pk: &PublicKey) -> Client {
        let dek = ChunkKey::generate();
        let (encapsulated, secret) = encapsulate_key(pk, 1, &dek).unwrap();
        let base_nonce = random_nonce();
        Client {
            encapsulated,
            secret,
            sealer: ChunkSealer::with_nonce(dek.clone(), base_nonce),
            dek,
            base_nonce,
        }
    }

    #[test]
    fn chunks_before_and_after_key_share_one_counter() {
        let (sk, pk) = generate_keypair();
        let mut c = client(&pk);
        let c0 = c.sealer.seal(b"zero", false).unwrap();
        let c1 = c.sealer.seal(b"one", false).unwrap();
        let c2 = c.sealer.seal(b"two", true).unwrap();

        let mut transport = TransportCipher::new();
        assert_eq!(transport.receive_chunk(&c0, false).unwrap(), None);
        assert_eq!(transport.receive_chunk(&c1, false).unwrap(), None);

        let handshake = transport
            .receive_key(&c.encapsulated, &sk, ResponseMode::Standard)
            .unwrap();
        assert_eq!(handshake.key_id, 1);
        assert_eq!(handshake.dek.as_bytes(), c.dek.as_bytes());
        assert_eq!(
            handshake.chunks,
            vec![
                DecryptedChunk {
                    data: b"zero".to_vec(),
                    is_final: false
                },
                DecryptedChunk {
                    data: b"one".to_vec(),
                    is_final: false
                },
            ]
        );
        assert_eq!(transport.counter(), 2);
        assert_eq!(
            transport.receive_chunk(&c2, true).unwrap(),
            Some(b"two".to_vec())
        );
        assert_eq!(transport.counter(), 3);
    }

    #[test]
    fn nonce_for_chunk_i_is_base_xor_i() {
        let (sk, pk) = generate_keypair();
        let c = client(&pk);
        let mut transport = TransportCipher::new();
        transport
            .receive_key(&c.encapsulated, &sk, ResponseMode::Standard)
            .unwrap();

        // Hand-seal each chunk with the expected nonce.
        let mut first = vec![0x00, 0x01];
        first.extend_from_slice(&c.base_nonce);
        first.extend(c.dek.seal(&c.base_nonce, b"a", false).unwrap());
        assert_eq!(transport.receive_chunk(&first, false).unwrap().unwrap(), b"a");

        for i in 1..5u64 {
            let nonce = chunk_nonce(&c.base_nonce, i);
            let sealed = c.dek.seal(&nonce, &[i as u8], false).unwrap();
            assert_eq!(
                transport.receive_chunk(&sealed, false).unwrap().unwrap(),
                vec![i as u8]
            );
            assert_eq!(transport.counter(), i + 1);
        }
    }

    #[test]
    fn second_key_is_rejected() {
        let (sk, pk) = generate_keypair();
        let c = client(&pk);
        let mut transport = TransportCipher::new();
        transport
            .receive_key(&c.encapsulated, &sk, ResponseMode::Standard)
            .unwrap();
        assert_eq!(
            transport
                .receive_key(&c.encapsulated, &sk, ResponseMode::Standard)
                .unwrap_err(),
            JobError::ReceivedKeyTwice
        );
    }

    #[test]
    fn final_flag_mismatch_fails_open() {
        let (sk, pk) = generate_keypair();
        let mut c = client(&pk);
        let chunk = c.sealer.seal(b"last", true).unwrap();
        let mut transport = TransportCipher::new();
        transport
            .receive_key(&c.encapsulated, &sk, ResponseMode::Standard)
            .unwrap();
        assert_eq!(
            transport.receive_chunk(&chunk, false).unwrap_err(),
            JobError::Crypto(CryptoError::OpenFailed)
        );
    }

    #[test]
    fn wrong_algorithm_tag_is_rejected() {
        let (sk, pk) = generate_keypair();
        let c = client(&pk);
        let mut transport = TransportCipher::new();
        transport
            .receive_key(&c.encapsulated, &sk, ResponseMode::Standard)
            .unwrap();
        let mut chunk = vec![0x00, 0x02];
        chunk.extend_from_slice(&[0u8; 28]);
        assert_eq!(
            transport.receive_chunk(&chunk, false).unwrap_err(),
            JobError::Crypto(CryptoError::InvalidAlgorithmTag(2))
        );
    }

    #[test]
    fn response_stream_opens_on_the_client() {
        let (sk, pk) = generate_keypair();
        let c = client(&pk);
        let mut transport = TransportCipher::new();
        let mut handshake = transport
            .receive_key(&c.encapsulated, &sk, ResponseMode::Standard)
            .unwrap();
        let r0 = handshake.encapsulator.encapsulate(b"r0", false).unwrap();
        let r1 = handshake.encapsulator.encapsulate(b"r1", true).unwrap();

        let mut opener = ResponseOpener::new(c.secret);
        assert_eq!(opener.open(&r0, false).unwrap(), b"r0");
        assert_eq!(opener.open(&r1, true).unwrap(), b"r1");
    }
}
