use confnode_crypto::ohttp::encapsulate_key;
use confnode_crypto::token::TokenIssuer;
use confnode_crypto::{ChunkKey, ChunkSealer, PublicKey, ResponseOpener};
use confnode_job::framing::frame_message;
use confnode_job::{DaemonMessage, JobMessage, Parameters, Reassembler};
use confnode_proto::app::v1::client_message::Kind as ClientKind;
use confnode_proto::app::v1::response_message::Kind;
use confnode_proto::app::v1::{AuthToken, ClientMessage, FinalMessage, ResponseMessage};
use prost::Message;

pub const REQUEST_ID: &str = "request-1";
const OTT: &[u8] = b"one-time-token";
const SALT: &[u8] = b"ott-salt";

/// The original requester: encrypts the request to a node key and opens the
/// response stream.
pub struct TestClient {
    encapsulated_key: Vec<u8>,
    sealer: ChunkSealer,
    opener: ResponseOpener,
    reassembler: Reassembler,
}

impl TestClient {
    pub fn new(node_key: &PublicKey, key_id: u8) -> Self {
        let dek = ChunkKey::generate();
        let (encapsulated_key, secret) =
            encapsulate_key(node_key, key_id, &dek).expect("encapsulation failed");
        Self {
            encapsulated_key,
            sealer: ChunkSealer::new(dek),
            opener: ResponseOpener::new(secret),
            reassembler: Reassembler::new(1 << 20),
        }
    }

    pub fn one_time_token(&self) -> Vec<u8> {
        OTT.to_vec()
    }

    pub fn parameters(&self) -> DaemonMessage {
        DaemonMessage::Parameters(Parameters {
            request_id: REQUEST_ID.to_string(),
            one_time_token: self.one_time_token(),
            encapsulated_key: self.encapsulated_key.clone(),
            ..Default::default()
        })
    }

    fn seal(&mut self, kind: ClientKind, is_final: bool) -> DaemonMessage {
        let message = ClientMessage { kind: Some(kind) };
        DaemonMessage::RequestChunk {
            encrypted_payload: self
                .sealer
                .seal(&frame_message(&message), is_final)
                .expect("seal failed"),
            is_final,
        }
    }

    /// A token-granting token from `issuer` bound to this request's OTT.
    pub fn auth_token(&mut self, issuer: &TokenIssuer) -> DaemonMessage {
        let token = issuer.issue(OTT, SALT, 0);
        self.seal(
            ClientKind::AuthToken(AuthToken {
                token_granting_token: token,
                ott_salt: SALT.to_vec(),
            }),
            false,
        )
    }

    pub fn payload(&mut self, data: &[u8], is_final: bool) -> DaemonMessage {
        self.seal(ClientKind::Payload(data.to_vec()), is_final)
    }

    pub fn finish(&mut self) -> DaemonMessage {
        self.seal(ClientKind::FinalMessage(FinalMessage {}), true)
    }

    /// Open every response chunk in `messages`, skipping other traffic.
    pub fn open(&mut self, messages: &[JobMessage]) -> Vec<Kind> {
        let mut out = Vec::new();
        for message in messages {
            if let JobMessage::ResponseChunk {
                encrypted_payload,
                is_final,
            } = message
            {
                out.extend(self.open_chunk(encrypted_payload, *is_final));
            }
        }
        out
    }

    pub fn open_chunk(&mut self, chunk: &[u8], is_final: bool) -> Vec<Kind> {
        let plaintext = self.opener.open(chunk, is_final).expect("open failed");
        self.reassembler
            .append(&plaintext, is_final)
            .expect("bad response framing")
            .into_iter()
            .map(|inner| {
                ResponseMessage::decode(inner.bytes.as_slice())
                    .expect("bad response message")
                    .kind
                    .expect("empty response message")
            })
            .collect()
    }
}
