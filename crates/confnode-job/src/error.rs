use confnode_crypto::CryptoError;
use confnode_proto::app::v1::ResponseStatus;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    // -- framing --
    #[error("message of {size} bytes exceeds the maximum of {max}")]
    ExceedingMaxMessageSize { size: usize, max: usize },

    #[error("received a chunk after the final chunk")]
    ReceivedAdditionalChunkAfterFinalChunk,

    #[error("final chunk contains an incomplete message")]
    FinalChunkContainsIncompleteMessage,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    // -- transport --
    #[error("received the request key twice")]
    ReceivedKeyTwice,

    #[error("received request parameters twice")]
    ReceivedParametersTwice,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    // -- auth --
    #[error("received the one-time token twice")]
    ReceivedOneTimeTokenTwice,

    #[error("received the token-granting token twice")]
    ReceivedTokenGrantingTokenTwice,

    #[error("missing one-time token")]
    MissingOneTimeToken,

    #[error("missing token-granting token")]
    MissingTokenGrantingToken,

    #[error("token validation failed: {0}")]
    TokenValidation(String),

    #[error("received application payload with request bypass enabled")]
    ReceivedApplicationPayloadWithRequestBypassEnabled,

    // -- worker proxy --
    #[error("worker requested after the final worker request")]
    WorkerRequestAfterFinal,

    #[error("unknown worker id {0}")]
    UnknownWorkerId(String),

    #[error("duplicate worker id {0}")]
    DuplicateWorkerId(String),

    #[error("worker {0} was found twice")]
    WorkerFoundResultReceivedTwice(String),

    #[error("worker {0} ended without being found")]
    WorkerFoundResultNeverReceived(String),

    #[error("worker {worker_id} failed attestation validation: {reason}")]
    WorkerAttestationValidationFailed { worker_id: String, reason: String },

    #[error("worker {0} offered response bypass that was not requested")]
    MissingResponseBypassCapability(String),

    #[error("worker {0} did not provide a response bypass context id")]
    MissingResponseBypassContextId(String),

    #[error("finding worker {worker_id} failed: code {code}: {message}")]
    FindWorkerFailed {
        worker_id: String,
        code: u32,
        message: String,
    },

    #[error("worker session {worker_id} failed: code {code}: {message}")]
    WorkerSessionFailed {
        worker_id: String,
        code: u32,
        message: String,
    },

    #[error("worker {0} responded before its key was released")]
    WorkerResponseBeforeFound(String),

    #[error("key rewrap for worker {worker_id} failed: {reason}")]
    KeyRewrap { worker_id: String, reason: String },

    #[error("this node is not configured to proxy requests")]
    ProxyNotPermitted,

    // -- job --
    #[error("this node rejects all requests")]
    RejectOnly,

    #[error("response already finished")]
    ResponseAlreadyFinished,

    #[error("workload error: {0}")]
    Workload(String),

    #[error("workload disconnected")]
    WorkloadDisconnected,

    #[error("daemon disconnected")]
    DaemonDisconnected,

    #[error("job abandoned")]
    Abandoned,

    #[error("job nacked: {0}")]
    Nacked(String),
}

pub type Result<T> = std::result::Result<T, JobError>;

impl JobError {
    /// The response summary status the client sees for this failure.
    pub fn status(&self) -> ResponseStatus {
        match self {
            JobError::TokenValidation(_) => ResponseStatus::Unauthenticated,

            JobError::ExceedingMaxMessageSize { .. }
            | JobError::ReceivedAdditionalChunkAfterFinalChunk
            | JobError::FinalChunkContainsIncompleteMessage
            | JobError::MalformedMessage(_)
            | JobError::ReceivedKeyTwice
            | JobError::ReceivedParametersTwice
            | JobError::ReceivedOneTimeTokenTwice
            | JobError::ReceivedTokenGrantingTokenTwice
            | JobError::MissingOneTimeToken
            | JobError::MissingTokenGrantingToken
            | JobError::ReceivedApplicationPayloadWithRequestBypassEnabled
            | JobError::RejectOnly => ResponseStatus::InvalidRequest,

            JobError::Crypto(e) => match e {
                CryptoError::Keychain(_)
                | CryptoError::SealFailed
                | CryptoError::KeyDerivation
                | CryptoError::CounterExhausted => ResponseStatus::InternalError,
                _ => ResponseStatus::InvalidRequest,
            },

            JobError::WorkerAttestationValidationFailed { .. }
            | JobError::MissingResponseBypassCapability(_)
            | JobError::MissingResponseBypassContextId(_) => {
                ResponseStatus::ProxyWorkerValidationError
            }
            JobError::FindWorkerFailed { .. } => ResponseStatus::ProxyFindWorkerError,
            JobError::WorkerSessionFailed { .. } => ResponseStatus::ProxyWorkerSessionError,

            _ => ResponseStatus::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            JobError::TokenValidation("bad".into()).status(),
            ResponseStatus::Unauthenticated
        );
        assert_eq!(
            JobError::Crypto(CryptoError::UnknownKeyId(4)).status(),
            ResponseStatus::InvalidRequest
        );
        assert_eq!(
            JobError::Crypto(CryptoError::Keychain("locked".into())).status(),
            ResponseStatus::InternalError
        );
        assert_eq!(
            JobError::FindWorkerFailed {
                worker_id: "w".into(),
                code: 3,
                message: String::new()
            }
            .status(),
            ResponseStatus::ProxyFindWorkerError
        );
        assert_eq!(
            JobError::WorkerSessionFailed {
                worker_id: "w".into(),
                code: 3,
                message: String::new()
            }
            .status(),
            ResponseStatus::ProxyWorkerSessionError
        );
        assert_eq!(JobError::Abandoned.status(), ResponseStatus::InternalError);
        assert_eq!(JobError::RejectOnly.status(), ResponseStatus::InvalidRequest);
    }
}
