//! The task driving one downstream worker session.

use crate::auth::TokenAndSalt;
use crate::error::{JobError, Result};
use crate::framing::{Reassembler, frame_message};
use crate::messages::{JobMessage, WorkerAttestation, WorkerClose, WorkerQuery};
use crate::promise::Promise;
use crate::proxy::{RequestKey, SessionEvent, WorkerSession, WorkerSessions};
use crate::response::ResponseWriter;
use crate::services::JobServices;
use confnode_crypto::chunk::AEAD_ID_AES_128_GCM;
use confnode_crypto::{ChunkSealer, ResponseOpener};
use confnode_proto::app::v1::client_message::Kind as ClientKind;
use confnode_proto::app::v1::response_message::Kind as ResponseKind;
use confnode_proto::app::v1::{
    AuthToken, ClientMessage, FinalMessage, ResponseBypassContext, ResponseMessage,
    ResponseStatus,
};
use confnode_workload::protocol::NodeMessage;
use prost::Message;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Job-wide handles a session task needs.
#[derive(Clone)]
pub(crate) struct SessionLink {
    pub job_id: String,
    pub services: JobServices,
    pub token: Arc<Promise<TokenAndSalt>>,
    pub request_key: Arc<Promise<RequestKey>>,
    pub outbound: mpsc::Sender<JobMessage>,
    pub workload: mpsc::Sender<NodeMessage>,
    pub writer: ResponseWriter,
    pub sessions: Arc<WorkerSessions>,
    pub max_message_size: usize,
    pub cancel: CancellationToken,
}

/// Run a session until the worker's response ends or the workload gives up
/// on it. Job shutdown ends the session by dropping its route.
pub(crate) async fn run_session(
    link: SessionLink,
    query: WorkerQuery,
    events: mpsc::Receiver<SessionEvent>,
) -> Result<()> {
    let worker_id = query.worker_id.clone();
    let sessions = link.sessions.clone();
    let mut task = SessionTask::new(link, query);
    let result = task.run(events).await;
    sessions.remove(&worker_id);
    if let Err(e) = &result {
        tracing::warn!(job_id = %task.link.job_id, worker_id = %worker_id, err = %e, "worker session failed");
    }
    result
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

struct SessionTask {
    link: SessionLink,
    session: WorkerSession,
    sealer: Option<ChunkSealer>,
    opener: Option<ResponseOpener>,
    reassembler: Reassembler,
    /// Requests that arrived before the key was released.
    pending: Vec<(Vec<u8>, bool)>,
    eof_pending: bool,
    requests_finished: bool,
}

impl SessionTask {
    fn new(link: SessionLink, query: WorkerQuery) -> Self {
        let reassembler = Reassembler::new(link.max_message_size);
        Self {
            link,
            session: WorkerSession::new(query),
            sealer: None,
            opener: None,
            reassembler,
            pending: Vec::new(),
            eof_pending: false,
            requests_finished: false,
        }
    }

    fn worker_id(&self) -> String {
        self.session.worker_id().to_string()
    }

    async fn run(&mut self, mut events: mpsc::Receiver<SessionEvent>) -> Result<()> {
        let cancel = self.link.cancel.clone();
        let (token, key) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            ready = async {
                tokio::try_join!(self.link.token.wait(), self.link.request_key.wait())
            } => ready?,
        };

        tracing::info!(
            job_id = %self.link.job_id,
            worker_id = %self.session.worker_id(),
            service = %self.session.query().service_name,
            "finding worker"
        );
        self.emit(JobMessage::FindWorker(self.session.query().clone()))
            .await?;

        while let Some(event) = events.recv().await {
            if self.handle(event, &token, &key).await? == Flow::Done {
                return Ok(());
            }
        }
        // Routes are dropped when the job shuts down.
        self.session.close()
    }

    async fn handle(
        &mut self,
        event: SessionEvent,
        token: &TokenAndSalt,
        key: &RequestKey,
    ) -> Result<Flow> {
        match event {
            SessionEvent::Attestation(attestation) => {
                self.on_attestation(attestation, token, key).await?;
            }
            SessionEvent::Request { data, is_final } => {
                if self.requests_finished || self.eof_pending {
                    return Err(JobError::WorkerRequestAfterFinal);
                }
                if self.session.is_key_released() {
                    self.send_request(data, is_final).await?;
                } else {
                    self.requests_finished = is_final;
                    self.pending.push((data, is_final));
                }
            }
            SessionEvent::RequestEof => {
                if self.session.is_key_released() {
                    self.finish_requests().await?;
                } else {
                    self.eof_pending = true;
                }
            }
            SessionEvent::Cancelled => {
                tracing::info!(
                    job_id = %self.link.job_id,
                    worker_id = %self.session.worker_id(),
                    "workload cancelled worker"
                );
                self.emit(JobMessage::WorkerError {
                    worker_id: self.worker_id(),
                })
                .await?;
                // Fails if the worker was never found.
                self.session.close()?;
                return Ok(Flow::Done);
            }
            SessionEvent::ResponseChunk { chunk, is_final } => {
                if !self.session.is_key_released() {
                    return Err(JobError::WorkerResponseBeforeFound(self.worker_id()));
                }
                self.on_response(chunk, is_final).await?;
            }
            SessionEvent::ResponseClose(close) => self.on_close(close).await?,
            SessionEvent::ResponseEof => {
                self.to_workload(NodeMessage::WorkerEof {
                    worker_id: self.worker_id(),
                })
                .await?;
                self.session.close()?;
                return Ok(Flow::Done);
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_attestation(
        &mut self,
        attestation: WorkerAttestation,
        token: &TokenAndSalt,
        key: &RequestKey,
    ) -> Result<()> {
        self.session.begin_validation()?;
        let worker_id = self.worker_id();

        let context_id = attestation
            .response_bypass_context_id
            .filter(|id| !id.is_empty());
        match (self.session.query().response_bypass, &context_id) {
            (false, Some(_)) => return Err(JobError::MissingResponseBypassCapability(worker_id)),
            (true, None) => return Err(JobError::MissingResponseBypassContextId(worker_id)),
            _ => {}
        }

        let bundle = self
            .link
            .services
            .attestation_validator
            .validate(&attestation.attestation_bundle, &key.addressed)
            .await
            .map_err(|e| JobError::WorkerAttestationValidationFailed {
                worker_id: worker_id.clone(),
                reason: format!("{e:#}"),
            })?;
        let rewrapped = self
            .link
            .services
            .key_rewrapper
            .rewrap(&bundle, &key.dek)
            .await
            .map_err(|e| JobError::KeyRewrap {
                worker_id: worker_id.clone(),
                reason: format!("{e:#}"),
            })?;

        let response_bypass = match context_id {
            Some(context_id) => {
                let material = rewrapped.response.bypass_key_material()?;
                Some(ResponseBypassContext {
                    aead_id: u32::from(AEAD_ID_AES_128_GCM),
                    key: material.key.as_bytes().to_vec(),
                    nonce: material.nonce.to_vec(),
                    context_id,
                })
            }
            None => None,
        };
        let bypass = response_bypass.is_some();

        self.session.submit_log_entry();
        let logged = self
            .link
            .writer
            .append_log(
                Some(attestation.attestation_bundle),
                response_bypass,
                self.session.query().is_final,
            )
            .await?;
        self.session.release_key();

        tracing::info!(
            job_id = %self.link.job_id,
            worker_id = %worker_id,
            release_digest = %bundle.release_digest,
            key_id = rewrapped.key_id,
            bypass,
            logged,
            "releasing request key to worker"
        );
        self.emit(JobMessage::WorkerDecryptionKey {
            worker_id: worker_id.clone(),
            key_id: rewrapped.key_id,
            encapsulated_key: rewrapped.encapsulated_key,
        })
        .await?;
        if !bypass {
            self.opener = Some(ResponseOpener::new(rewrapped.response));
        }
        self.to_workload(NodeMessage::WorkerFound {
            worker_id: worker_id.clone(),
        })
        .await?;

        self.sealer = Some(ChunkSealer::new(key.dek.clone()));
        let auth = ClientMessage {
            kind: Some(ClientKind::AuthToken(AuthToken {
                token_granting_token: token.token_granting_token.clone(),
                ott_salt: token.salt.clone(),
            })),
        };
        self.send_sealed(&auth, false).await?;

        // Released before this point, so the final flag was already noted.
        self.requests_finished = false;
        for (data, is_final) in std::mem::take(&mut self.pending) {
            self.send_request(data, is_final).await?;
        }
        if self.eof_pending {
            self.finish_requests().await?;
        }
        Ok(())
    }

    async fn send_request(&mut self, data: Vec<u8>, is_final: bool) -> Result<()> {
        if self.requests_finished {
            return Err(JobError::WorkerRequestAfterFinal);
        }
        let msg = ClientMessage {
            kind: Some(ClientKind::Payload(data)),
        };
        self.send_sealed(&msg, is_final).await?;
        self.requests_finished = is_final;
        Ok(())
    }

    async fn finish_requests(&mut self) -> Result<()> {
        if !self.requests_finished {
            let msg = ClientMessage {
                kind: Some(ClientKind::FinalMessage(FinalMessage {})),
            };
            self.send_sealed(&msg, true).await?;
            self.requests_finished = true;
        }
        self.eof_pending = false;
        self.emit(JobMessage::WorkerRequestEof {
            worker_id: self.worker_id(),
        })
        .await
    }

    async fn send_sealed(&mut self, msg: &ClientMessage, is_final: bool) -> Result<()> {
        let Some(sealer) = self.sealer.as_mut() else {
            unreachable!("worker request sealed before key release");
        };
        let message = sealer.seal(&frame_message(msg), is_final)?;
        self.emit(JobMessage::WorkerRequestMessage {
            worker_id: self.worker_id(),
            message,
            is_final,
        })
        .await
    }

    async fn on_response(&mut self, chunk: Vec<u8>, is_final: bool) -> Result<()> {
        let worker_id = self.worker_id();
        let Some(opener) = self.opener.as_mut() else {
            // Bypass: the client decrypts this stream itself.
            return self
                .to_workload(NodeMessage::WorkerResponse {
                    worker_id,
                    data: chunk,
                    is_final,
                    status: None,
                })
                .await;
        };

        let plaintext = opener.open(&chunk, is_final)?;
        for msg in self.reassembler.append(&plaintext, is_final)? {
            if msg.bytes.is_empty() && msg.is_final {
                continue;
            }
            let decoded = ResponseMessage::decode(msg.bytes.as_slice())
                .map_err(|e| JobError::MalformedMessage(e.to_string()))?;
            match decoded.kind {
                Some(ResponseKind::ResponseUuid(uuid)) => {
                    tracing::debug!(job_id = %self.link.job_id, worker_id = %worker_id, %uuid, "worker response id");
                }
                Some(ResponseKind::Payload(data)) => {
                    self.to_workload(NodeMessage::WorkerResponse {
                        worker_id: worker_id.clone(),
                        data,
                        is_final: msg.is_final,
                        status: None,
                    })
                    .await?;
                }
                Some(ResponseKind::Summary(summary)) => {
                    let status = ResponseStatus::try_from(summary.status)
                        .unwrap_or(ResponseStatus::InternalError);
                    self.to_workload(NodeMessage::WorkerResponse {
                        worker_id: worker_id.clone(),
                        data: Vec::new(),
                        is_final: true,
                        status: Some(status.as_str_name().to_string()),
                    })
                    .await?;
                }
                Some(ResponseKind::ExecutionLogEntry(entry)) => {
                    if entry.attestation.is_some() || entry.response_bypass.is_some() {
                        let logged = self
                            .link
                            .writer
                            .append_log(entry.attestation, entry.response_bypass, false)
                            .await?;
                        if !logged {
                            tracing::info!(
                                job_id = %self.link.job_id,
                                worker_id = %worker_id,
                                "nested execution log entry after final; skipped"
                            );
                        }
                    }
                }
                None => {
                    return Err(JobError::MalformedMessage(
                        "empty worker response message".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn on_close(&mut self, close: WorkerClose) -> Result<()> {
        let worker_id = self.worker_id();
        if let Some(code) = close.ropes_error_code {
            let message = close.ropes_message.unwrap_or_default();
            return Err(if self.session.was_found() {
                JobError::WorkerSessionFailed {
                    worker_id,
                    code,
                    message,
                }
            } else {
                JobError::FindWorkerFailed {
                    worker_id,
                    code,
                    message,
                }
            });
        }
        self.to_workload(NodeMessage::WorkerClose {
            worker_id,
            grpc_status: close.grpc_status,
            grpc_message: close.grpc_message,
        })
        .await
    }

    async fn emit(&self, msg: JobMessage) -> Result<()> {
        self.link
            .outbound
            .send(msg)
            .await
            .map_err(|_| JobError::DaemonDisconnected)
    }

    async fn to_workload(&self, msg: NodeMessage) -> Result<()> {
        self.link
            .workload
            .send(msg)
            .await
            .map_err(|_| JobError::WorkloadDisconnected)
    }
}
