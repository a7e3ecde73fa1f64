//! Bookkeeping for the downstream workers a proxy job talks to.
//!
//! Each worker gets a [`WorkerSession`] state value, owned by its session
//! task, and an entry in the job's [`WorkerSessions`] table through which
//! the orchestrator routes events to that task.

use crate::error::{JobError, Result};
use crate::messages::{WorkerAttestation, WorkerClose, WorkerQuery};
use confnode_crypto::{AttestedKey, ChunkKey};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// The request key and the attested identity the client addressed.
#[derive(Debug, Clone)]
pub struct RequestKey {
    pub dek: ChunkKey,
    pub addressed: AttestedKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `FindWorker` sent, no attestation yet.
    AwaitingFound,
    /// Attestation received, being validated and rewrapped.
    Validating,
    /// Execution log entry submitted, not yet acknowledged.
    LogEntryPending,
    /// The worker holds the request key.
    KeyReleased,
    Closed,
}

/// Lifecycle of one worker session. Transitions the session task never
/// takes panic.
#[derive(Debug)]
pub struct WorkerSession {
    query: WorkerQuery,
    state: SessionState,
    attested: bool,
}

impl WorkerSession {
    pub fn new(query: WorkerQuery) -> Self {
        Self {
            query,
            state: SessionState::AwaitingFound,
            attested: false,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.query.worker_id
    }

    pub fn query(&self) -> &WorkerQuery {
        &self.query
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_key_released(&self) -> bool {
        self.state == SessionState::KeyReleased
    }

    /// Whether an attestation was ever received, valid or not.
    pub fn was_found(&self) -> bool {
        self.attested
    }

    pub fn begin_validation(&mut self) -> Result<()> {
        if self.attested {
            return Err(JobError::WorkerFoundResultReceivedTwice(
                self.worker_id().to_string(),
            ));
        }
        self.transition(SessionState::AwaitingFound, SessionState::Validating);
        self.attested = true;
        Ok(())
    }

    pub fn submit_log_entry(&mut self) {
        self.transition(SessionState::Validating, SessionState::LogEntryPending);
    }

    pub fn release_key(&mut self) {
        self.transition(SessionState::LogEntryPending, SessionState::KeyReleased);
    }

    /// End the session. Fails if the worker was never found.
    pub fn close(&mut self) -> Result<()> {
        self.state = SessionState::Closed;
        if self.attested {
            Ok(())
        } else {
            Err(JobError::WorkerFoundResultNeverReceived(
                self.worker_id().to_string(),
            ))
        }
    }

    fn transition(&mut self, from: SessionState, to: SessionState) {
        if self.state != from {
            panic!(
                "worker session {}: {:?} -> {:?} from {:?}",
                self.query.worker_id, from, to, self.state
            );
        }
        self.state = to;
    }
}

/// Input to a session task.
#[derive(Debug)]
pub enum SessionEvent {
    Attestation(WorkerAttestation),
    /// Request payload from the workload.
    Request { data: Vec<u8>, is_final: bool },
    /// The workload has no more requests for this worker.
    RequestEof,
    /// The workload gave up on this worker.
    Cancelled,
    ResponseChunk { chunk: Vec<u8>, is_final: bool },
    ResponseClose(WorkerClose),
    ResponseEof,
}

#[derive(Default)]
struct Table {
    sessions: HashMap<String, mpsc::Sender<SessionEvent>>,
    /// Sessions whose task has ended. Late events for them are dropped.
    ended: HashSet<String>,
    final_requested: bool,
    closed: bool,
}

/// Routes events to live session tasks by worker id.
#[derive(Default)]
pub struct WorkerSessions {
    table: Mutex<Table>,
}

impl WorkerSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session for `query` and return its event stream.
    pub fn register(
        &self,
        query: &WorkerQuery,
        capacity: usize,
    ) -> Result<mpsc::Receiver<SessionEvent>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(JobError::Abandoned);
        }
        if table.final_requested {
            return Err(JobError::WorkerRequestAfterFinal);
        }
        if table.sessions.contains_key(&query.worker_id) {
            return Err(JobError::DuplicateWorkerId(query.worker_id.clone()));
        }
        let (tx, rx) = mpsc::channel(capacity);
        table.ended.remove(&query.worker_id);
        table.sessions.insert(query.worker_id.clone(), tx);
        table.final_requested = query.is_final;
        Ok(rx)
    }

    /// Deliver an event to a live session. Events for a session that has
    /// already ended are dropped.
    pub async fn route(&self, worker_id: &str, event: SessionEvent) -> Result<()> {
        let tx = {
            let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            match table.sessions.get(worker_id) {
                Some(tx) => tx.clone(),
                None if table.ended.contains(worker_id) => {
                    tracing::debug!(%worker_id, "event for ended worker session dropped");
                    return Ok(());
                }
                None => return Err(JobError::UnknownWorkerId(worker_id.to_string())),
            }
        };
        // The task may have ended between lookup and send.
        if tx.send(event).await.is_err() {
            tracing::debug!(%worker_id, "worker session ended before delivery");
        }
        Ok(())
    }

    /// Drop the route of a session whose task has ended.
    pub fn remove(&self, worker_id: &str) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.sessions.remove(worker_id).is_some() {
            table.ended.insert(worker_id.to_string());
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new sessions and drop every route. Session tasks see their
    /// event stream end.
    pub fn close_all(&self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.closed = true;
        table.sessions.clear();
        table.ended.clear();
    }
}
