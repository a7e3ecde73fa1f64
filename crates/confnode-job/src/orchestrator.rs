//! One job, end to end.
//!
//! A job runs as a consumer task over daemon input, a producer task over
//! workload output, one task per downstream worker, and the response writer.
//! The first failure is recorded, the job is marked abandoned and every task
//! is cancelled; the response summary is still flushed before `EndJob`.

use crate::auth::AuthStateMachine;
use crate::config::{JobConfig, Role};
use crate::error::{JobError, Result};
use crate::framing::{InnerMessage, Reassembler};
use crate::messages::{DaemonMessage, JobMessage, Parameters, WorkerQuery};
use crate::promise::Promise;
use crate::proxy::{RequestKey, SessionEvent, WorkerSessions};
use crate::response::ResponseWriter;
use crate::services::JobServices;
use crate::transport::{DecryptedChunk, TransportCipher};
use crate::worker::{SessionLink, run_session};
use confnode_crypto::ResponseMode;
use confnode_crypto::ohttp::peek_key_id;
use confnode_crypto::time::now_ms;
use confnode_proto::app::v1::client_message::Kind as ClientKind;
use confnode_proto::app::v1::{ClientMessage, ResponseStatus};
use confnode_workload::protocol::{AppMessage, NodeMessage};
use prost::Message;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    AwaitingParameters,
    Active,
    Abandoning,
    Terminated,
}

/// The channels a job runs over. The daemon owns the other ends.
pub struct JobChannels {
    pub inbound: mpsc::Receiver<DaemonMessage>,
    pub outbound: mpsc::Sender<JobMessage>,
    pub to_workload: mpsc::Sender<NodeMessage>,
    pub from_workload: mpsc::Receiver<AppMessage>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub request_id: Option<String>,
    /// Status of the summary the client received, if one was sent.
    pub summary: Option<ResponseStatus>,
    pub abandoned: bool,
    pub error: Option<JobError>,
}

#[derive(Debug)]
struct JobMeta {
    state: JobState,
    request_id: Option<String>,
    feature_id: String,
    bundle_id: String,
    summary: Option<ResponseStatus>,
}

/// State shared by the tasks of one job.
struct JobShared {
    job_id: String,
    meta: Mutex<JobMeta>,
    failure: Mutex<Option<JobError>>,
    cancel: CancellationToken,
}

impl JobShared {
    fn meta(&self) -> std::sync::MutexGuard<'_, JobMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure and abandon the job. The first failure wins.
    fn fail(&self, err: JobError) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_none() {
                tracing::warn!(job_id = %self.job_id, err = %err, status = err.status().as_str_name(), "job failed");
                *failure = Some(err);
            } else {
                tracing::debug!(job_id = %self.job_id, err = %err, "additional job failure");
            }
        }
        {
            let mut meta = self.meta();
            if meta.state != JobState::Terminated {
                meta.state = JobState::Abandoning;
            }
        }
        self.cancel.cancel();
    }

    fn failure(&self) -> Option<JobError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_abandoned(&self) -> bool {
        self.meta().state == JobState::Abandoning
    }

    /// Stop every task without failing the job.
    fn stop(&self) {
        self.cancel.cancel();
    }

    /// Send the summary if it was not sent yet, and tell the daemon about
    /// internal errors.
    async fn finish_response(
        &self,
        writer: &ResponseWriter,
        outbound: &mpsc::Sender<JobMessage>,
        status: ResponseStatus,
    ) -> Result<bool> {
        let sent = writer.finish(status).await?;
        if sent {
            self.meta().summary = Some(status);
            if status == ResponseStatus::InternalError {
                outbound
                    .send(JobMessage::InternalError)
                    .await
                    .map_err(|_| JobError::DaemonDisconnected)?;
            }
        }
        Ok(sent)
    }
}

pub struct Job {
    job_id: String,
    config: JobConfig,
    services: JobServices,
}

impl Job {
    pub fn new(job_id: impl Into<String>, config: JobConfig, services: JobServices) -> Self {
        Self {
            job_id: job_id.into(),
            config,
            services,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn run(self, channels: JobChannels) -> JobOutcome {
        let JobChannels {
            inbound,
            outbound,
            to_workload,
            from_workload,
        } = channels;
        let shared = Arc::new(JobShared {
            job_id: self.job_id.clone(),
            meta: Mutex::new(JobMeta {
                state: JobState::AwaitingParameters,
                request_id: None,
                feature_id: String::new(),
                bundle_id: String::new(),
                summary: None,
            }),
            failure: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        tracing::info!(job_id = %self.job_id, role = %self.config.role, "job started");

        let (writer, writer_task) = ResponseWriter::spawn(self.job_id.clone(), outbound.clone());
        let auth = AuthStateMachine::new(self.config.enforce_token_validation);
        let request_key = Arc::new(Promise::new());
        let sessions = Arc::new(WorkerSessions::new());

        let link = SessionLink {
            job_id: self.job_id.clone(),
            services: self.services.clone(),
            token: auth.token(),
            request_key: request_key.clone(),
            outbound: outbound.clone(),
            workload: to_workload.clone(),
            writer: writer.clone(),
            sessions: sessions.clone(),
            max_message_size: self.config.max_message_size,
            cancel: shared.cancel.clone(),
        };
        let consumer = Consumer {
            shared: shared.clone(),
            config: self.config.clone(),
            services: self.services,
            auth,
            transport: TransportCipher::new(),
            reassembler: Reassembler::new(self.config.max_message_size),
            request_key,
            writer: writer.clone(),
            outbound: outbound.clone(),
            workload: to_workload,
            sessions: sessions.clone(),
            parameters_received: false,
            workload_engaged: false,
        };
        let producer = Producer {
            shared: shared.clone(),
            config: self.config,
            link,
            writer: writer.clone(),
            outbound: outbound.clone(),
            sessions,
            tasks: JoinSet::new(),
        };

        let consumer = tokio::spawn(consumer.run(inbound));
        let producer = tokio::spawn(producer.run(from_workload));
        for joined in [consumer.await, producer.await] {
            if let Err(e) = joined {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }

        let error = shared.failure();
        let status = error
            .as_ref()
            .map(JobError::status)
            .unwrap_or(ResponseStatus::InternalError);
        if let Err(e) = shared.finish_response(&writer, &outbound, status).await {
            tracing::warn!(job_id = %self.job_id, err = %e, "could not finish response");
        }
        drop(writer);
        let _ = writer_task.await;
        if outbound.send(JobMessage::EndJob).await.is_err() {
            tracing::debug!(job_id = %self.job_id, "daemon gone before end of job");
        }

        let mut meta = shared.meta();
        let abandoned = meta.state == JobState::Abandoning;
        meta.state = JobState::Terminated;
        tracing::info!(
            job_id = %self.job_id,
            request_id = meta.request_id.as_deref().unwrap_or(""),
            feature_id = %meta.feature_id,
            bundle_id = %meta.bundle_id,
            summary = meta.summary.map(|s| s.as_str_name()).unwrap_or("none"),
            abandoned,
            "job finished"
        );
        JobOutcome {
            job_id: self.job_id,
            request_id: meta.request_id.clone(),
            summary: meta.summary,
            abandoned,
            error,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

/// Daemon input: parameters, the request stream and worker traffic.
struct Consumer {
    shared: Arc<JobShared>,
    config: JobConfig,
    services: JobServices,
    auth: AuthStateMachine,
    transport: TransportCipher,
    reassembler: Reassembler,
    request_key: Arc<Promise<RequestKey>>,
    writer: ResponseWriter,
    outbound: mpsc::Sender<JobMessage>,
    workload: mpsc::Sender<NodeMessage>,
    sessions: Arc<WorkerSessions>,
    parameters_received: bool,
    /// Parameters were forwarded, so the workload knows about this job.
    workload_engaged: bool,
}

impl Consumer {
    async fn run(mut self, inbound: mpsc::Receiver<DaemonMessage>) {
        let result = self.consume(inbound).await;
        let torn_down = matches!(result, Ok(true));
        if let Err(e) = result {
            self.shared.fail(e);
        }

        if self.shared.is_abandoned() {
            self.auth.abandon();
            if self.workload_engaged {
                let _ = self.workload.send(NodeMessage::Abandon).await;
            }
        }
        if let Err(e) = self.auth.terminate() {
            self.shared.fail(e);
        }
        self.request_key.fail(JobError::Abandoned);

        if torn_down && !self.shared.is_abandoned() {
            let _ = self.outbound.send(JobMessage::JobHelperEof).await;
        }
    }

    /// Returns true if the daemon tore the job down.
    async fn consume(&mut self, mut inbound: mpsc::Receiver<DaemonMessage>) -> Result<bool> {
        let cancel = self.shared.cancel.clone();
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(false),
                msg = inbound.recv() => msg,
            };
            let Some(msg) = msg else {
                return Err(JobError::DaemonDisconnected);
            };
            match msg {
                DaemonMessage::Teardown => {
                    tracing::info!(job_id = %self.shared.job_id, "teardown");
                    if self.workload_engaged {
                        self.to_workload(NodeMessage::Teardown).await?;
                    }
                    return Ok(true);
                }
                msg => {
                    if self.handle(msg).await? == Flow::Done {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: DaemonMessage) -> Result<Flow> {
        match msg {
            DaemonMessage::Warmup {
                workload_type,
                details,
            } => {
                tracing::debug!(job_id = %self.shared.job_id, %workload_type, "warmup");
                self.to_workload(NodeMessage::Warmup {
                    workload_type,
                    details,
                })
                .await?;
            }
            DaemonMessage::Parameters(parameters) => self.on_parameters(parameters).await?,
            DaemonMessage::RequestChunk {
                encrypted_payload,
                is_final,
            } => {
                if let Some(plaintext) = self.transport.receive_chunk(&encrypted_payload, is_final)? {
                    self.on_plaintext(&plaintext, is_final).await?;
                }
            }
            DaemonMessage::WorkerAttestation(attestation) => {
                self.require_proxy()?;
                let worker_id = attestation.worker_id.clone();
                self.sessions
                    .route(&worker_id, SessionEvent::Attestation(attestation))
                    .await?;
            }
            DaemonMessage::WorkerResponseChunk {
                worker_id,
                chunk,
                is_final,
            } => {
                self.require_proxy()?;
                self.sessions
                    .route(&worker_id, SessionEvent::ResponseChunk { chunk, is_final })
                    .await?;
            }
            DaemonMessage::WorkerResponseClose(close) => {
                self.require_proxy()?;
                let worker_id = close.worker_id.clone();
                self.sessions
                    .route(&worker_id, SessionEvent::ResponseClose(close))
                    .await?;
            }
            DaemonMessage::WorkerResponseEof { worker_id } => {
                self.require_proxy()?;
                self.sessions
                    .route(&worker_id, SessionEvent::ResponseEof)
                    .await?;
            }
            DaemonMessage::Abandon => {
                tracing::info!(job_id = %self.shared.job_id, "abandoned by daemon");
                self.shared.fail(JobError::Abandoned);
                return Ok(Flow::Done);
            }
            DaemonMessage::Nack { reason } => {
                tracing::warn!(job_id = %self.shared.job_id, %reason, "nacked");
                self.auth.abandon();
                self.writer.append_log(None, None, true).await?;
                self.shared.fail(JobError::Nacked(reason));
                return Ok(Flow::Done);
            }
            DaemonMessage::Teardown => unreachable!("handled by consume"),
        }
        Ok(Flow::Continue)
    }

    async fn on_parameters(&mut self, parameters: Parameters) -> Result<()> {
        if self.parameters_received {
            return Err(JobError::ReceivedParametersTwice);
        }
        self.parameters_received = true;
        let Parameters {
            request_id,
            one_time_token,
            encapsulated_key,
            request_bypass,
            response_bypass,
            feature_id,
            bundle_id,
        } = parameters;
        {
            let mut meta = self.shared.meta();
            meta.state = JobState::Active;
            meta.request_id = Some(request_id.clone());
            meta.feature_id = feature_id.clone();
            meta.bundle_id = bundle_id.clone();
        }
        tracing::info!(
            job_id = %self.shared.job_id,
            %request_id,
            request_bypass,
            response_bypass,
            "parameters"
        );

        self.auth.receive_request_bypass_mode(request_bypass)?;
        self.auth.receive_one_time_token(one_time_token)?;

        let key_id = peek_key_id(&encapsulated_key)?;
        let addressed = self.services.keys.lookup(key_id, now_ms())?;
        let private_key = self.services.private_key(&addressed).await?;
        let mode = if response_bypass {
            ResponseMode::ForcedState
        } else {
            ResponseMode::Standard
        };
        let handshake = self
            .transport
            .receive_key(&encapsulated_key, &private_key, mode)?;
        tracing::debug!(
            job_id = %self.shared.job_id,
            key_id = handshake.key_id,
            buffered = handshake.chunks.len(),
            "request key established"
        );
        self.writer.establish(handshake.encapsulator).await?;
        self.request_key.resolve(RequestKey {
            dek: handshake.dek,
            addressed,
        });

        if self.config.role == Role::RejectOnly {
            return Err(JobError::RejectOnly);
        }

        self.to_workload(NodeMessage::Parameters {
            request_id,
            feature_id,
            bundle_id,
        })
        .await?;
        self.workload_engaged = true;

        for DecryptedChunk { data, is_final } in handshake.chunks {
            self.on_plaintext(&data, is_final).await?;
        }
        Ok(())
    }

    async fn on_plaintext(&mut self, plaintext: &[u8], is_final: bool) -> Result<()> {
        for msg in self.reassembler.append(plaintext, is_final)? {
            self.on_client_message(msg).await?;
        }
        Ok(())
    }

    async fn on_client_message(&mut self, msg: InnerMessage) -> Result<()> {
        let kind = ClientMessage::decode(msg.bytes.as_slice())
            .map_err(|e| JobError::MalformedMessage(e.to_string()))?
            .kind;
        let mut delivered_final = false;
        match kind {
            Some(ClientKind::Payload(data)) => {
                delivered_final = msg.is_final;
                self.deliver(DecryptedChunk {
                    data,
                    is_final: msg.is_final,
                })
                .await?;
            }
            Some(ClientKind::AuthToken(token)) => {
                let released = self
                    .auth
                    .receive_auth_token(
                        token.token_granting_token,
                        token.ott_salt,
                        self.services.token_validator.as_ref(),
                    )
                    .await?;
                tracing::debug!(
                    job_id = %self.shared.job_id,
                    released = released.len(),
                    "request authenticated"
                );
                for chunk in released {
                    self.forward(chunk).await?;
                }
            }
            Some(ClientKind::FinalMessage(_)) => {}
            None if msg.is_final => {}
            None => {
                return Err(JobError::MalformedMessage(
                    "empty client message".to_string(),
                ));
            }
        }

        if msg.is_final {
            if !delivered_final && !self.auth.request_bypass() {
                self.deliver(DecryptedChunk {
                    data: Vec::new(),
                    is_final: true,
                })
                .await?;
            }
            self.auth.require_validated()?;
        }
        Ok(())
    }

    async fn deliver(&mut self, chunk: DecryptedChunk) -> Result<()> {
        if let Some(chunk) = self.auth.receive_chunk(chunk)? {
            self.forward(chunk).await?;
        }
        Ok(())
    }

    async fn forward(&self, chunk: DecryptedChunk) -> Result<()> {
        self.to_workload(NodeMessage::Chunk {
            data: chunk.data,
            is_final: chunk.is_final,
        })
        .await
    }

    fn require_proxy(&self) -> Result<()> {
        if self.config.role == Role::Proxy {
            Ok(())
        } else {
            Err(JobError::ProxyNotPermitted)
        }
    }

    async fn to_workload(&self, msg: NodeMessage) -> Result<()> {
        self.workload
            .send(msg)
            .await
            .map_err(|_| JobError::WorkloadDisconnected)
    }
}

/// Session panics are re-raised; aborted sessions are ignored.
fn session_result(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Ok(()),
    }
}

/// Workload output: the response and requests for downstream workers.
struct Producer {
    shared: Arc<JobShared>,
    config: JobConfig,
    link: SessionLink,
    writer: ResponseWriter,
    outbound: mpsc::Sender<JobMessage>,
    sessions: Arc<WorkerSessions>,
    tasks: JoinSet<Result<()>>,
}

impl Producer {
    async fn run(mut self, from_workload: mpsc::Receiver<AppMessage>) {
        match self.produce(from_workload).await {
            Ok(()) => self.shared.stop(),
            Err(e) => self.shared.fail(e),
        }

        self.sessions.close_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = session_result(joined) {
                self.shared.fail(e);
            }
        }
    }

    async fn produce(&mut self, mut from_workload: mpsc::Receiver<AppMessage>) -> Result<()> {
        let cancel = self.shared.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    session_result(joined)?;
                }
                msg = from_workload.recv() => {
                    let Some(msg) = msg else {
                        return Err(JobError::WorkloadDisconnected);
                    };
                    if self.handle(msg).await? == Flow::Done {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: AppMessage) -> Result<Flow> {
        match msg {
            AppMessage::Chunk { data, is_final } => {
                tracing::trace!(job_id = %self.shared.job_id, bytes = data.len(), is_final, "response payload");
                self.writer.payload(data).await?;
            }
            AppMessage::InternalError { message } => {
                tracing::warn!(job_id = %self.shared.job_id, %message, "workload internal error");
                let sent = self
                    .shared
                    .finish_response(&self.writer, &self.outbound, ResponseStatus::InternalError)
                    .await?;
                if !sent {
                    tracing::warn!(
                        job_id = %self.shared.job_id,
                        "internal error after summary; not retransmitted"
                    );
                }
            }
            AppMessage::EndOfResponse => {
                self.shared
                    .finish_response(&self.writer, &self.outbound, ResponseStatus::Ok)
                    .await?;
            }
            AppMessage::EndJob => return Ok(Flow::Done),
            AppMessage::AppTermination { reason } => {
                return Err(JobError::Workload(format!("workload terminated: {reason}")));
            }
            AppMessage::FindWorker {
                worker_id,
                service_name,
                routing_parameters,
                response_bypass,
                is_final,
            } => {
                if self.config.role != Role::Proxy {
                    return Err(JobError::ProxyNotPermitted);
                }
                let query = WorkerQuery {
                    worker_id,
                    service_name,
                    routing_parameters,
                    response_bypass,
                    is_final,
                };
                let events = self.sessions.register(&query, self.config.channel_capacity)?;
                self.tasks
                    .spawn(run_session(self.link.clone(), query, events));
            }
            AppMessage::WorkerRequest {
                worker_id,
                data,
                is_final,
            } => {
                self.sessions
                    .route(&worker_id, SessionEvent::Request { data, is_final })
                    .await?;
            }
            AppMessage::WorkerEof { worker_id } => {
                self.sessions
                    .route(&worker_id, SessionEvent::RequestEof)
                    .await?;
            }
            AppMessage::WorkerError { worker_id } => {
                self.sessions
                    .route(&worker_id, SessionEvent::Cancelled)
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }
}
