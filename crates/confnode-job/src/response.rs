//! The response stream of one job.
//!
//! A single task owns the response encapsulator and the execution log, so
//! payload, log entries and the summary are sealed in exactly the order they
//! are accepted. Everyone else talks to it through [`ResponseWriter`].

use crate::error::{JobError, Result};
use crate::framing::frame_message;
use crate::messages::JobMessage;
use crate::rel::ExecutionLog;
use confnode_crypto::ResponseEncapsulator;
use confnode_proto::app::v1::response_message::Kind;
use confnode_proto::app::v1::{
    ExecutionLogEntry, ResponseBypassContext, ResponseMessage, ResponseStatus, ResponseSummary,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum WriterCommand {
    Establish(Box<ResponseEncapsulator>),
    Payload(Vec<u8>),
    LogEntry {
        attestation: Option<Vec<u8>>,
        response_bypass: Option<ResponseBypassContext>,
        is_final: bool,
        ack: oneshot::Sender<Result<bool>>,
    },
    Finish {
        status: ResponseStatus,
        ack: oneshot::Sender<bool>,
    },
}

/// Handle to the response stream.
#[derive(Clone)]
pub struct ResponseWriter {
    tx: mpsc::Sender<WriterCommand>,
}

impl ResponseWriter {
    /// Start the writer task. It exits once every handle is dropped.
    pub fn spawn(job_id: String, outbound: mpsc::Sender<JobMessage>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let actor = WriterActor {
            job_id,
            outbound,
            encapsulator: None,
            pending: Vec::new(),
            log: ExecutionLog::new(),
            summary_sent: false,
        };
        (Self { tx }, tokio::spawn(actor.run(rx)))
    }

    async fn send(&self, cmd: WriterCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| JobError::DaemonDisconnected)
    }

    /// Set the response key. The response UUID goes out first.
    pub async fn establish(&self, encapsulator: ResponseEncapsulator) -> Result<()> {
        self.send(WriterCommand::Establish(Box::new(encapsulator)))
            .await
    }

    pub async fn payload(&self, data: Vec<u8>) -> Result<()> {
        self.send(WriterCommand::Payload(data)).await
    }

    /// Append an execution log entry and wait until it has been accepted.
    /// Returns false if the log was already final and the entry was skipped.
    pub async fn append_log(
        &self,
        attestation: Option<Vec<u8>>,
        response_bypass: Option<ResponseBypassContext>,
        is_final: bool,
    ) -> Result<bool> {
        let (ack, rx) = oneshot::channel();
        self.send(WriterCommand::LogEntry {
            attestation,
            response_bypass,
            is_final,
            ack,
        })
        .await?;
        rx.await.map_err(|_| JobError::DaemonDisconnected)?
    }

    /// Send the summary if none was sent yet. Returns whether this call sent it.
    pub async fn finish(&self, status: ResponseStatus) -> Result<bool> {
        let (ack, rx) = oneshot::channel();
        self.send(WriterCommand::Finish { status, ack }).await?;
        rx.await.map_err(|_| JobError::DaemonDisconnected)
    }
}

struct WriterActor {
    job_id: String,
    outbound: mpsc::Sender<JobMessage>,
    encapsulator: Option<Box<ResponseEncapsulator>>,
    /// Messages accepted before the response key was known.
    pending: Vec<ResponseMessage>,
    log: ExecutionLog,
    summary_sent: bool,
}

impl WriterActor {
    async fn run(mut self, mut rx: mpsc::Receiver<WriterCommand>) {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = self.handle(cmd).await {
                tracing::warn!(job_id = %self.job_id, err = %e, "response writer failed");
                break;
            }
        }
    }

    async fn handle(&mut self, cmd: WriterCommand) -> Result<()> {
        match cmd {
            WriterCommand::Establish(encapsulator) => {
                if self.encapsulator.is_some() {
                    return Err(JobError::ReceivedKeyTwice);
                }
                self.encapsulator = Some(encapsulator);
                let uuid = uuid::Uuid::new_v4().to_string();
                self.emit(message(Kind::ResponseUuid(uuid)), false).await?;
                for msg in std::mem::take(&mut self.pending) {
                    self.emit(msg, false).await?;
                }
            }
            WriterCommand::Payload(data) => {
                if self.summary_sent {
                    tracing::warn!(
                        job_id = %self.job_id,
                        bytes = data.len(),
                        "dropping response payload after summary"
                    );
                    return Ok(());
                }
                self.queue(message(Kind::Payload(data))).await?;
            }
            WriterCommand::LogEntry {
                attestation,
                response_bypass,
                is_final,
                ack,
            } => {
                let outcome = self
                    .append_log(attestation, response_bypass, is_final)
                    .await;
                let failed = outcome.as_ref().err().cloned();
                let _ = ack.send(outcome);
                // Only transport failures stop the writer.
                if let Some(e @ (JobError::DaemonDisconnected | JobError::Crypto(_))) = failed {
                    return Err(e);
                }
            }
            WriterCommand::Finish { status, ack } => {
                let sent = self.finish(status).await?;
                let _ = ack.send(sent);
            }
        }
        Ok(())
    }

    async fn append_log(
        &mut self,
        attestation: Option<Vec<u8>>,
        response_bypass: Option<ResponseBypassContext>,
        is_final: bool,
    ) -> Result<bool> {
        if self.log.is_finalized() {
            tracing::debug!(
                job_id = %self.job_id,
                evidence = attestation.is_some(),
                "execution log already final; entry skipped"
            );
            return Ok(false);
        }
        if self.summary_sent {
            return Err(JobError::ResponseAlreadyFinished);
        }
        let entry = self.log.append(attestation, response_bypass, is_final)?;
        self.queue_log_entry(entry).await?;
        Ok(true)
    }

    async fn queue_log_entry(&mut self, entry: Option<ExecutionLogEntry>) -> Result<()> {
        if let Some(entry) = entry {
            tracing::debug!(
                job_id = %self.job_id,
                is_final = entry.is_final,
                "execution log entry"
            );
            self.queue(message(Kind::ExecutionLogEntry(entry))).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, status: ResponseStatus) -> Result<bool> {
        if self.summary_sent {
            tracing::debug!(
                job_id = %self.job_id,
                status = status.as_str_name(),
                "summary already sent"
            );
            return Ok(false);
        }
        self.summary_sent = true;
        if self.encapsulator.is_none() {
            tracing::warn!(
                job_id = %self.job_id,
                status = status.as_str_name(),
                "no response key established; summary not sent"
            );
            return Ok(false);
        }
        // The client must see a closed log before the summary.
        if !self.log.is_empty() {
            let entry = self.log.finalize()?;
            self.queue_log_entry(entry).await?;
        }
        let summary = ResponseSummary {
            status: status.into(),
        };
        self.emit(message(Kind::Summary(summary)), true).await?;
        self.outbound
            .send(JobMessage::EndOfResponse)
            .await
            .map_err(|_| JobError::DaemonDisconnected)?;
        tracing::info!(job_id = %self.job_id, status = status.as_str_name(), "response finished");
        Ok(true)
    }

    async fn queue(&mut self, msg: ResponseMessage) -> Result<()> {
        if self.encapsulator.is_some() {
            self.emit(msg, false).await
        } else {
            self.pending.push(msg);
            Ok(())
        }
    }

    async fn emit(&mut self, msg: ResponseMessage, is_final: bool) -> Result<()> {
        let Some(encapsulator) = self.encapsulator.as_mut() else {
            unreachable!("emit before establish");
        };
        let encrypted_payload = encapsulator.encapsulate(&frame_message(&msg), is_final)?;
        self.outbound
            .send(JobMessage::ResponseChunk {
                encrypted_payload,
                is_final,
            })
            .await
            .map_err(|_| JobError::DaemonDisconnected)
    }
}

fn message(kind: Kind) -> ResponseMessage {
    ResponseMessage { kind: Some(kind) }
}
