//! The request core of a confidential compute node.
//!
//! A [`Job`] terminates one client's encrypted request: it opens the request
//! key, authenticates the request before any of it reaches the workload,
//! streams the encrypted response back, and (on proxy nodes) forwards the
//! request to attested downstream workers while keeping the client's
//! execution log.

pub mod auth;
pub mod config;
pub mod error;
pub mod framing;
pub mod messages;
pub mod orchestrator;
pub mod promise;
pub mod proxy;
pub mod rel;
pub mod response;
pub mod services;
pub mod transport;
mod worker;

pub use auth::{AuthStateMachine, TokenAndSalt};
pub use config::{JobConfig, Role};
pub use error::{JobError, Result};
pub use framing::{InnerMessage, Reassembler};
pub use messages::{
    DaemonMessage, JobMessage, Parameters, WorkerAttestation, WorkerClose, WorkerQuery,
};
pub use orchestrator::{Job, JobChannels, JobOutcome, JobState};
pub use promise::Promise;
pub use services::{
    AttestationClient, AttestationValidator, HpkeKeyRewrapper, JobServices, KeyRewrapper,
    RewrappedKey, TokenValidator,
};
pub use transport::{DecryptedChunk, Handshake, TransportCipher};
