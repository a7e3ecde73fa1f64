//! Conversions between pipeline frames and job messages.

use anyhow::{Result, anyhow, bail};
use confnode_job::{DaemonMessage, JobMessage, Parameters, WorkerAttestation, WorkerClose, WorkerQuery};
use confnode_proto::pipeline::v1 as pb;
use confnode_proto::pipeline::v1::daemon_frame::Frame as DaemonKind;
use confnode_proto::pipeline::v1::job_frame::Frame as JobKind;

pub fn daemon_message(frame: pb::DaemonFrame) -> Result<DaemonMessage> {
    let Some(kind) = frame.frame else {
        bail!("empty daemon frame");
    };
    Ok(match kind {
        DaemonKind::Warmup(w) => DaemonMessage::Warmup {
            workload_type: w.workload_type,
            details: w.details.into_iter().collect(),
        },
        DaemonKind::Parameters(p) => DaemonMessage::Parameters(Parameters {
            request_id: p.request_id,
            one_time_token: p.one_time_token,
            encapsulated_key: p.encapsulated_key,
            request_bypass: p.request_bypass,
            response_bypass: p.response_bypass,
            feature_id: p.feature_id,
            bundle_id: p.bundle_id,
        }),
        DaemonKind::RequestChunk(c) => DaemonMessage::RequestChunk {
            encrypted_payload: c.encrypted_payload,
            is_final: c.is_final,
        },
        DaemonKind::WorkerAttestation(a) => DaemonMessage::WorkerAttestation(WorkerAttestation {
            worker_id: a.worker_id,
            attestation_bundle: a.attestation_bundle,
            response_bypass_context_id: a.response_bypass_context_id,
        }),
        DaemonKind::WorkerResponseChunk(c) => DaemonMessage::WorkerResponseChunk {
            worker_id: c.worker_id,
            chunk: c.chunk,
            is_final: c.is_final,
        },
        DaemonKind::WorkerResponseClose(c) => DaemonMessage::WorkerResponseClose(WorkerClose {
            worker_id: c.worker_id,
            grpc_status: c.grpc_status,
            grpc_message: c.grpc_message,
            ropes_error_code: c.ropes_error_code,
            ropes_message: c.ropes_message,
        }),
        DaemonKind::WorkerResponseEof(e) => DaemonMessage::WorkerResponseEof {
            worker_id: e.worker_id,
        },
        DaemonKind::Teardown(_) => DaemonMessage::Teardown,
        DaemonKind::Abandon(_) => DaemonMessage::Abandon,
        DaemonKind::Nack(n) => DaemonMessage::Nack { reason: n.reason },
    })
}

pub fn daemon_frame(message: DaemonMessage) -> pb::DaemonFrame {
    let kind = match message {
        DaemonMessage::Warmup {
            workload_type,
            details,
        } => DaemonKind::Warmup(pb::Warmup {
            workload_type,
            details: details.into_iter().collect(),
        }),
        DaemonMessage::Parameters(p) => DaemonKind::Parameters(pb::Parameters {
            request_id: p.request_id,
            one_time_token: p.one_time_token,
            encapsulated_key: p.encapsulated_key,
            request_bypass: p.request_bypass,
            response_bypass: p.response_bypass,
            feature_id: p.feature_id,
            bundle_id: p.bundle_id,
        }),
        DaemonMessage::RequestChunk {
            encrypted_payload,
            is_final,
        } => DaemonKind::RequestChunk(pb::RequestChunk {
            encrypted_payload,
            is_final,
        }),
        DaemonMessage::WorkerAttestation(a) => DaemonKind::WorkerAttestation(pb::WorkerAttestation {
            worker_id: a.worker_id,
            attestation_bundle: a.attestation_bundle,
            response_bypass_context_id: a.response_bypass_context_id,
        }),
        DaemonMessage::WorkerResponseChunk {
            worker_id,
            chunk,
            is_final,
        } => DaemonKind::WorkerResponseChunk(pb::WorkerResponseChunk {
            worker_id,
            chunk,
            is_final,
        }),
        DaemonMessage::WorkerResponseClose(c) => {
            DaemonKind::WorkerResponseClose(pb::WorkerResponseClose {
                worker_id: c.worker_id,
                grpc_status: c.grpc_status,
                grpc_message: c.grpc_message,
                ropes_error_code: c.ropes_error_code,
                ropes_message: c.ropes_message,
            })
        }
        DaemonMessage::WorkerResponseEof { worker_id } => {
            DaemonKind::WorkerResponseEof(pb::WorkerResponseEof { worker_id })
        }
        DaemonMessage::Teardown => DaemonKind::Teardown(pb::Teardown {}),
        DaemonMessage::Abandon => DaemonKind::Abandon(pb::Abandon {}),
        DaemonMessage::Nack { reason } => DaemonKind::Nack(pb::Nack { reason }),
    };
    pb::DaemonFrame { frame: Some(kind) }
}

pub fn job_frame(message: JobMessage) -> pb::JobFrame {
    let kind = match message {
        JobMessage::ResponseChunk {
            encrypted_payload,
            is_final,
        } => JobKind::ResponseChunk(pb::ResponseChunk {
            encrypted_payload,
            is_final,
        }),
        JobMessage::FindWorker(q) => JobKind::FindWorker(pb::FindWorker {
            worker_id: q.worker_id,
            service_name: q.service_name,
            routing_parameters: q.routing_parameters.into_iter().collect(),
            response_bypass: q.response_bypass,
            is_final: q.is_final,
        }),
        JobMessage::WorkerDecryptionKey {
            worker_id,
            key_id,
            encapsulated_key,
        } => JobKind::WorkerDecryptionKey(pb::WorkerDecryptionKey {
            worker_id,
            key_id: u32::from(key_id),
            encapsulated_key,
        }),
        JobMessage::WorkerRequestMessage {
            worker_id,
            message,
            is_final,
        } => JobKind::WorkerRequestMessage(pb::WorkerRequestMessage {
            worker_id,
            message,
            is_final,
        }),
        JobMessage::WorkerRequestEof { worker_id } => {
            JobKind::WorkerRequestEof(pb::WorkerRequestEof { worker_id })
        }
        JobMessage::WorkerError { worker_id } => JobKind::WorkerError(pb::WorkerError { worker_id }),
        JobMessage::JobHelperEof => JobKind::JobHelperEof(pb::JobHelperEof {}),
        JobMessage::InternalError => JobKind::InternalError(pb::InternalError {}),
        JobMessage::EndOfResponse => JobKind::EndOfResponse(pb::EndOfResponse {}),
        JobMessage::EndJob => JobKind::EndJob(pb::EndJob {}),
    };
    pb::JobFrame { frame: Some(kind) }
}

pub fn job_message(frame: pb::JobFrame) -> Result<JobMessage> {
    let Some(kind) = frame.frame else {
        bail!("empty job frame");
    };
    Ok(match kind {
        JobKind::ResponseChunk(c) => JobMessage::ResponseChunk {
            encrypted_payload: c.encrypted_payload,
            is_final: c.is_final,
        },
        JobKind::FindWorker(f) => JobMessage::FindWorker(WorkerQuery {
            worker_id: f.worker_id,
            service_name: f.service_name,
            routing_parameters: f.routing_parameters.into_iter().collect(),
            response_bypass: f.response_bypass,
            is_final: f.is_final,
        }),
        JobKind::WorkerDecryptionKey(k) => JobMessage::WorkerDecryptionKey {
            worker_id: k.worker_id,
            key_id: u8::try_from(k.key_id)
                .map_err(|_| anyhow!("key id {} out of range", k.key_id))?,
            encapsulated_key: k.encapsulated_key,
        },
        JobKind::WorkerRequestMessage(m) => JobMessage::WorkerRequestMessage {
            worker_id: m.worker_id,
            message: m.message,
            is_final: m.is_final,
        },
        JobKind::WorkerRequestEof(e) => JobMessage::WorkerRequestEof {
            worker_id: e.worker_id,
        },
        JobKind::WorkerError(e) => JobMessage::WorkerError {
            worker_id: e.worker_id,
        },
        JobKind::JobHelperEof(_) => JobMessage::JobHelperEof,
        JobKind::InternalError(_) => JobMessage::InternalError,
        JobKind::EndOfResponse(_) => JobMessage::EndOfResponse,
        JobKind::EndJob(_) => JobMessage::EndJob,
    })
}
