//! In-memory backend that records calls instead of launching anything.
//! Used by dry-run comparisons and by the test suites.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BackendError, BackendResult, ScriptBatch, SubmissionBackend, SubmitReceipt};

#[derive(Debug, Default)]
pub struct RecordingBackend {
    reject_slots: HashSet<u32>,
    submitted: Mutex<Vec<ScriptBatch>>,
    cancelled: Mutex<Vec<(u32, String)>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse batches for these slots
    pub fn rejecting(slots: impl IntoIterator<Item = u32>) -> Self {
        Self {
            reject_slots: slots.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn submitted(&self) -> Vec<ScriptBatch> {
        self.submitted.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn cancelled(&self) -> Vec<(u32, String)> {
        self.cancelled.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SubmissionBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn submit(&self, batch: &ScriptBatch) -> BackendResult<SubmitReceipt> {
        if self.reject_slots.contains(&batch.slot) {
            return Err(BackendError::Rejected {
                program: "recording".to_string(),
                status: 1,
                stderr: format!("slot {} rejected", batch.slot),
            });
        }
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.push(batch.clone());
        }
        Ok(SubmitReceipt {
            slot: batch.slot,
            backend_ref: format!("mock-{}", batch.slot),
        })
    }

    async fn cancel(&self, slot: u32, backend_ref: &str) -> BackendResult<()> {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push((slot, backend_ref.to_string()));
        }
        Ok(())
    }
}
