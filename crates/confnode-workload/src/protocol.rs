use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum size of a JSON-lines frame on the workload socket (4 MiB).
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Protocol version sent in [`NodeMessage::Hello`].
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Node -> app
// ---------------------------------------------------------------------------

/// A message sent from the node to the workload for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    /// First message on every connection.
    Hello { job_id: String, version: u32 },
    /// Prepare for a job of the given type before parameters arrive.
    Warmup {
        workload_type: String,
        #[serde(default)]
        details: BTreeMap<String, String>,
    },
    /// Request metadata, sent once the request key is established.
    Parameters {
        request_id: String,
        #[serde(default)]
        feature_id: String,
        #[serde(default)]
        bundle_id: String,
    },
    /// Decrypted, authenticated application payload.
    Chunk {
        #[serde(with = "b64")]
        data: Vec<u8>,
        is_final: bool,
    },
    /// A worker requested with `FindWorker` passed attestation and received
    /// its key; requests to it may now flow.
    WorkerFound { worker_id: String },
    /// Payload from a worker. Opaque ciphertext when the worker answers the
    /// client directly.
    WorkerResponse {
        worker_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
        is_final: bool,
        /// The worker's response status, set on its last message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    /// The worker's response stream closed with a transport status.
    WorkerClose {
        worker_id: String,
        grpc_status: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grpc_message: Option<String>,
    },
    /// The worker's response stream ended.
    WorkerEof { worker_id: String },
    /// The client finished; release resources.
    Teardown,
    /// The job was abandoned; stop work and end the job.
    Abandon,
}

// ---------------------------------------------------------------------------
// App -> node
// ---------------------------------------------------------------------------

/// A message sent from the workload to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppMessage {
    /// Response payload for the client.
    Chunk {
        #[serde(with = "b64")]
        data: Vec<u8>,
        is_final: bool,
    },
    /// The workload failed the request.
    InternalError { message: String },
    /// The response is complete.
    EndOfResponse,
    /// The workload is done with the job.
    EndJob,
    /// The workload process is going away.
    AppTermination { reason: String },
    /// Ask the node to find a downstream worker.
    FindWorker {
        worker_id: String,
        service_name: String,
        #[serde(default)]
        routing_parameters: BTreeMap<String, String>,
        #[serde(default)]
        response_bypass: bool,
        #[serde(default)]
        is_final: bool,
    },
    /// Request payload for a found worker.
    WorkerRequest {
        worker_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
        is_final: bool,
    },
    /// No more requests for this worker.
    WorkerEof { worker_id: String },
    /// The workload gave up on this worker.
    WorkerError { worker_id: String },
}

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_bytes_are_base64() {
        let msg = AppMessage::Chunk {
            data: b"hi".to_vec(),
            is_final: true,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"chunk","data":"aGk=","is_final":true}"#);
        assert_eq!(serde_json::from_str::<AppMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn find_worker_defaults() {
        let msg: AppMessage =
            serde_json::from_str(r#"{"type":"find_worker","worker_id":"w1","service_name":"svc"}"#)
                .unwrap();
        assert_eq!(
            msg,
            AppMessage::FindWorker {
                worker_id: "w1".to_string(),
                service_name: "svc".to_string(),
                routing_parameters: BTreeMap::new(),
                response_bypass: false,
                is_final: false,
            }
        );
    }

    #[test]
    fn worker_response_status_skips_none() {
        let msg = NodeMessage::WorkerResponse {
            worker_id: "w1".to_string(),
            data: Vec::new(),
            is_final: false,
            status: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("status"));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = serde_json::from_str::<NodeMessage>(r#"{"type":"chunk","data":"@@","is_final":false}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unit_variants() {
        assert_eq!(
            serde_json::to_string(&NodeMessage::Teardown).unwrap(),
            r#"{"type":"teardown"}"#
        );
        assert_eq!(
            serde_json::from_str::<AppMessage>(r#"{"type":"end_of_response"}"#).unwrap(),
            AppMessage::EndOfResponse
        );
    }
}
