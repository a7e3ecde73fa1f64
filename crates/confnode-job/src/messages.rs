//! Messages exchanged with the daemon, independent of their wire encoding.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Parameters {
    pub request_id: String,
    pub one_time_token: Vec<u8>,
    pub encapsulated_key: Vec<u8>,
    pub request_bypass: bool,
    pub response_bypass: bool,
    pub feature_id: String,
    pub bundle_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAttestation {
    pub worker_id: String,
    pub attestation_bundle: Vec<u8>,
    pub response_bypass_context_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerClose {
    pub worker_id: String,
    pub grpc_status: i32,
    pub grpc_message: Option<String>,
    /// Set when the routing layer failed the session.
    pub ropes_error_code: Option<u32>,
    pub ropes_message: Option<String>,
}

/// What the daemon sends into a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    Warmup {
        workload_type: String,
        details: BTreeMap<String, String>,
    },
    Parameters(Parameters),
    RequestChunk {
        encrypted_payload: Vec<u8>,
        is_final: bool,
    },
    WorkerAttestation(WorkerAttestation),
    WorkerResponseChunk {
        worker_id: String,
        chunk: Vec<u8>,
        is_final: bool,
    },
    WorkerResponseClose(WorkerClose),
    WorkerResponseEof {
        worker_id: String,
    },
    Teardown,
    Abandon,
    Nack {
        reason: String,
    },
}

/// A request to route part of this job to a downstream worker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerQuery {
    pub worker_id: String,
    pub service_name: String,
    pub routing_parameters: BTreeMap<String, String>,
    pub response_bypass: bool,
    /// No further workers will be requested after this one.
    pub is_final: bool,
}

/// What a job sends back to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMessage {
    ResponseChunk {
        encrypted_payload: Vec<u8>,
        is_final: bool,
    },
    FindWorker(WorkerQuery),
    WorkerDecryptionKey {
        worker_id: String,
        key_id: u8,
        encapsulated_key: Vec<u8>,
    },
    WorkerRequestMessage {
        worker_id: String,
        message: Vec<u8>,
        is_final: bool,
    },
    WorkerRequestEof {
        worker_id: String,
    },
    WorkerError {
        worker_id: String,
    },
    JobHelperEof,
    InternalError,
    EndOfResponse,
    EndJob,
}
