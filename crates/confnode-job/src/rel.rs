//! Request execution log: the client-visible record of every node that was
//! given this request's key.

use crate::error::{JobError, Result};
use confnode_proto::app::v1::{ExecutionLogEntry, ResponseBypassContext};

#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: usize,
    finalized: bool,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Build the next entry to send. Returns `None` when finalizing an
    /// already-final log with no new evidence.
    pub fn append(
        &mut self,
        attestation: Option<Vec<u8>>,
        response_bypass: Option<ResponseBypassContext>,
        is_final: bool,
    ) -> Result<Option<ExecutionLogEntry>> {
        if self.finalized {
            if attestation.is_none() && response_bypass.is_none() && is_final {
                return Ok(None);
            }
            return Err(JobError::WorkerRequestAfterFinal);
        }
        self.finalized = is_final;
        self.entries += 1;
        Ok(Some(ExecutionLogEntry {
            attestation,
            response_bypass,
            is_final,
        }))
    }

    pub fn finalize(&mut self) -> Result<Option<ExecutionLogEntry>> {
        self.append(None, None, true)
    }
}
