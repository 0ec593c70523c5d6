//! Submission backends
//!
//! A backend takes one slot's script batch and starts it somewhere: a local
//! process group, a remote node over ssh, or a scheduler queue. Completion is
//! never reported back through the backend process itself; every task leaves
//! a done marker in the output area, which [`SubmissionBackend::poll`] reads.

mod local;
pub mod mock;
mod remote;

pub use local::LocalBackend;
pub use remote::{SchedulerBackend, SshBackend};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RunConfig;
use crate::error::{Result, SubmitError};

/// Contents of a done marker for a task that exited zero
pub const MARKER_SUCCESS: &str = "SUCCESS";
/// Contents of a done marker for a task that exited non-zero
pub const MARKER_FAILURE: &str = "FAILURE";

/// Errors raised by a submission backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with status {status}: {stderr}")]
    Rejected {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("Could not read a job reference from output: {0:?}")]
    MissingReference(String),

    #[error("Cancel not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Scripts for one worker slot, ready to submit
#[derive(Debug, Clone)]
pub struct ScriptBatch {
    pub slot: u32,
    /// Shell script running the slot's tasks in order
    pub cmd_script: PathBuf,
    /// Scheduler wrapper, present only for scheduler backends
    pub batch_script: Option<PathBuf>,
    /// Combined stdout/stderr of the slot
    pub log_file: PathBuf,
    /// Directory the batch is started from
    pub work_dir: PathBuf,
    pub task_ids: Vec<String>,
}

/// Returned by a backend that accepted a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub slot: u32,
    /// Handle used to cancel the batch later (pid, host:pid or job id)
    pub backend_ref: String,
}

/// What a task's done marker says
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// No marker yet
    Pending,
    Success,
    Failure { reason: String },
}

#[async_trait]
pub trait SubmissionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start one slot's batch
    async fn submit(&self, batch: &ScriptBatch) -> BackendResult<SubmitReceipt>;

    /// Read a task's completion marker
    async fn poll(&self, done_marker: &Path) -> BackendResult<TaskOutcome> {
        read_done_marker(done_marker).await
    }

    /// Stop a running batch; cancelling one that already ended is not an error
    async fn cancel(&self, slot: u32, backend_ref: &str) -> BackendResult<()>;
}

pub async fn read_done_marker(path: &Path) -> BackendResult<TaskOutcome> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TaskOutcome::Pending),
        Err(e) => return Err(e.into()),
    };

    Ok(match content.trim() {
        "" => TaskOutcome::Pending,
        MARKER_SUCCESS => TaskOutcome::Success,
        MARKER_FAILURE => TaskOutcome::Failure {
            reason: "non-zero exit status".to_string(),
        },
        other => TaskOutcome::Failure {
            reason: format!("unexpected done marker contents: {}", other),
        },
    })
}

/// Which backend a run uses, as recorded in the run snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSpec {
    Local {
        ncore: u32,
    },
    Ssh {
        nodes: Vec<String>,
    },
    Scheduler {
        submit_cmd: String,
        cancel_cmd: Option<String>,
        template: PathBuf,
        ncore: u32,
    },
}

impl BackendSpec {
    /// Pick the backend from `BATCH_INFO`, `NODELIST` or `NCORE`
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let batch_info = config.get_str("BATCH_INFO");
        let nodelist = config.get_str("NODELIST");

        match (batch_info, nodelist) {
            (Some(_), Some(_)) => Err(SubmitError::InvalidConfig(
                "BATCH_INFO and NODELIST cannot both be set".to_string(),
            )),
            (Some(info), None) => {
                let parts: Vec<&str> = info.split_whitespace().collect();
                let [submit_cmd, template, ncore] = parts.as_slice() else {
                    return Err(SubmitError::InvalidConfig(format!(
                        "BATCH_INFO must be '<submit-cmd> <template> <ncore>', got '{}'",
                        info
                    )));
                };
                let ncore = parse_ncore("BATCH_INFO", ncore)?;
                let template = PathBuf::from(*template);
                let template = if template.is_absolute() {
                    template
                } else {
                    config.env.launch_dir.join(template)
                };
                Ok(BackendSpec::Scheduler {
                    cancel_cmd: config
                        .get_str("BATCH_CANCEL")
                        .or_else(|| default_cancel_command(submit_cmd).map(str::to_string)),
                    submit_cmd: submit_cmd.to_string(),
                    template,
                    ncore,
                })
            }
            (None, Some(nodes)) => {
                let nodes: Vec<String> = nodes.split_whitespace().map(str::to_string).collect();
                if nodes.is_empty() {
                    return Err(SubmitError::InvalidConfig("NODELIST is empty".to_string()));
                }
                Ok(BackendSpec::Ssh { nodes })
            }
            (None, None) => {
                let ncore = match config.get_str("NCORE") {
                    Some(n) => parse_ncore("NCORE", &n)?,
                    None => 1,
                };
                Ok(BackendSpec::Local { ncore })
            }
        }
    }

    /// Number of worker slots the backend offers
    pub fn n_slots(&self) -> u32 {
        match self {
            BackendSpec::Local { ncore } | BackendSpec::Scheduler { ncore, .. } => *ncore,
            BackendSpec::Ssh { nodes } => nodes.len() as u32,
        }
    }

    pub fn uses_batch_wrapper(&self) -> bool {
        matches!(self, BackendSpec::Scheduler { .. })
    }

    pub fn build(&self) -> Arc<dyn SubmissionBackend> {
        match self {
            BackendSpec::Local { .. } => Arc::new(LocalBackend::new()),
            BackendSpec::Ssh { nodes } => Arc::new(SshBackend::new(nodes.clone())),
            BackendSpec::Scheduler {
                submit_cmd,
                cancel_cmd,
                ..
            } => Arc::new(SchedulerBackend::new(submit_cmd.clone(), cancel_cmd.clone())),
        }
    }
}

fn parse_ncore(key: &str, value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(SubmitError::InvalidConfig(format!(
            "{}: number of cores must be a positive integer, got '{}'",
            key, value
        ))),
    }
}

fn default_cancel_command(submit_cmd: &str) -> Option<&'static str> {
    let program = Path::new(submit_cmd).file_name()?.to_str()?;
    match program {
        "sbatch" => Some("scancel"),
        "qsub" => Some("qdel"),
        "bsub" => Some("bkill"),
        _ => None,
    }
}
