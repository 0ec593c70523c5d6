//! Error types for submit-batch
//!
//! Every failure a component can report is a variant here. Components return
//! these as values; only the binary decides which of them end the process and
//! with what exit code.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::ledger::TaskState;

/// Main error type for run preparation, submission and merging
#[derive(Error, Debug)]
pub enum SubmitError {
    /// Input has neither a CONFIG block nor any legacy discriminant
    #[error("Unrecognized legacy input file: {path:?}")]
    UnrecognizedInput { path: PathBuf },

    /// Canonical input uses a key that is no longer supported
    #[error("Obsolete key '{key}' no longer valid. Comment: {comment}")]
    ObsoleteKey { key: String, comment: String },

    /// None of the classification rules matched
    #[error("Cannot determine program class (SIM, FIT, BBC) for {path:?}")]
    UnclassifiableConfig { path: PathBuf },

    /// Output directory already exists and overwrite was not requested
    #[error("Output directory already exists: {path:?} (use --overwrite to replace it)")]
    OutputExists { path: PathBuf },

    /// Ledger state did not match the expected `from` state
    #[error("Invalid transition for task {task_id}: expected {expected}, found {found}, requested {requested}")]
    InvalidTransition {
        task_id: String,
        expected: TaskState,
        found: TaskState,
        requested: TaskState,
    },

    /// Busy token could not be acquired within the bounded wait
    #[error("Timed out after {waited:?} waiting for merge lock {path:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// One batch of tasks was rejected by the submission backend
    #[error("Submission failed for worker slot {slot}: {source}")]
    BackendSubmission {
        slot: u32,
        #[source]
        source: BackendError,
    },

    /// Structurally invalid configuration value
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Task planner could not expand the configuration
    #[error("Planning error: {0}")]
    Plan(String),

    /// Merge invocation carries a token from a superseded run
    #[error("Run token mismatch: merge invoked for run {found}, output belongs to run {expected}")]
    RunTokenMismatch { expected: i64, found: i64 },

    #[error("No merge ledger found at {path:?}")]
    LedgerMissing { path: PathBuf },

    #[error("Merge ledger already exists at {path:?}")]
    LedgerExists { path: PathBuf },

    #[error("No run snapshot found at {path:?}")]
    SnapshotMissing { path: PathBuf },

    #[error("Task not found in ledger: {0}")]
    UnknownTask(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for submit-batch operations
pub type Result<T> = std::result::Result<T, SubmitError>;

impl SubmitError {
    /// Errors raised before anything is submitted because the input is unusable
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            SubmitError::UnrecognizedInput { .. }
                | SubmitError::ObsoleteKey { .. }
                | SubmitError::UnclassifiableConfig { .. }
                | SubmitError::OutputExists { .. }
                | SubmitError::InvalidConfig(_)
                | SubmitError::Plan(_)
        )
    }

    /// Errors that only abandon the current merge attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SubmitError::LockTimeout { .. } | SubmitError::RunTokenMismatch { .. }
        )
    }
}
