use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{BackendError, BackendResult, ScriptBatch, SubmissionBackend, SubmitReceipt};

/// Run a command to completion and return its stdout
async fn run_capture(program: &str, args: &[String], work_dir: Option<&Path>) -> BackendResult<String> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    tracing::debug!("Running {:?}", cmd);

    let output = cmd.output().await.map_err(|source| BackendError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        return Err(BackendError::Rejected {
            program: program.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr,
        });
    }
    if !stderr.is_empty() {
        tracing::warn!("{} stderr: {}", program, stderr);
    }
    Ok(stdout)
}

/// Last word of the last non-empty output line
///
/// Covers "Submitted batch job 123", "123.server" and a bare pid.
fn last_word(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()?
        .split_whitespace()
        .last()
}

/// Wrap a value in single quotes for a remote shell
fn quoted(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Starts each slot batch on its own node over ssh
#[derive(Debug, Clone)]
pub struct SshBackend {
    nodes: Vec<String>,
    ssh: String,
}

impl SshBackend {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            ssh: "ssh".to_string(),
        }
    }

    fn node_for(&self, slot: u32) -> BackendResult<&str> {
        if self.nodes.is_empty() {
            return Err(BackendError::Unsupported("no nodes configured".to_string()));
        }
        Ok(&self.nodes[slot as usize % self.nodes.len()])
    }

    fn launch_line(batch: &ScriptBatch) -> String {
        format!(
            "cd {} && setsid sh {} > {} 2>&1 < /dev/null & echo $!",
            quoted(&batch.work_dir.to_string_lossy()),
            quoted(&batch.cmd_script.to_string_lossy()),
            quoted(&batch.log_file.to_string_lossy()),
        )
    }
}

#[async_trait]
impl SubmissionBackend for SshBackend {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn submit(&self, batch: &ScriptBatch) -> BackendResult<SubmitReceipt> {
        let node = self.node_for(batch.slot)?;
        let args = vec!["-x".to_string(), node.to_string(), Self::launch_line(batch)];
        let stdout = run_capture(&self.ssh, &args, None).await?;

        let pid = last_word(&stdout)
            .filter(|p| p.parse::<u32>().is_ok())
            .ok_or_else(|| BackendError::MissingReference(stdout.clone()))?;

        tracing::info!("CPU{:04} started on {} as pid {}", batch.slot, node, pid);
        Ok(SubmitReceipt {
            slot: batch.slot,
            backend_ref: format!("{}:{}", node, pid),
        })
    }

    async fn cancel(&self, slot: u32, backend_ref: &str) -> BackendResult<()> {
        let (node, pid) = backend_ref
            .rsplit_once(':')
            .ok_or_else(|| BackendError::MissingReference(backend_ref.to_string()))?;

        // the batch is a session leader, so its pid is also its group id;
        // "|| true" because an already-finished batch is not an error
        let args = vec![
            "-x".to_string(),
            node.to_string(),
            format!("kill -TERM -- -{} 2>/dev/null || true", pid),
        ];
        run_capture(&self.ssh, &args, None).await?;
        tracing::info!("Cancelled CPU{:04} on {} (pid {})", slot, node, pid);
        Ok(())
    }
}

/// Hands each slot's batch wrapper to a scheduler queue
#[derive(Debug, Clone)]
pub struct SchedulerBackend {
    submit_cmd: String,
    cancel_cmd: Option<String>,
}

impl SchedulerBackend {
    pub fn new(submit_cmd: String, cancel_cmd: Option<String>) -> Self {
        Self {
            submit_cmd,
            cancel_cmd,
        }
    }
}

#[async_trait]
impl SubmissionBackend for SchedulerBackend {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn submit(&self, batch: &ScriptBatch) -> BackendResult<SubmitReceipt> {
        let script = batch.batch_script.as_ref().ok_or_else(|| {
            BackendError::Unsupported(format!("CPU{:04} has no batch wrapper", batch.slot))
        })?;
        let dir = script.parent().unwrap_or(&batch.work_dir);

        let args = vec![script.to_string_lossy().to_string()];
        let stdout = run_capture(&self.submit_cmd, &args, Some(dir)).await?;
        let job_id = last_word(&stdout).ok_or_else(|| BackendError::MissingReference(stdout.clone()))?;

        tracing::info!("CPU{:04} queued as job {}", batch.slot, job_id);
        Ok(SubmitReceipt {
            slot: batch.slot,
            backend_ref: job_id.to_string(),
        })
    }

    async fn cancel(&self, slot: u32, backend_ref: &str) -> BackendResult<()> {
        let Some(cancel_cmd) = &self.cancel_cmd else {
            return Err(BackendError::Unsupported(format!(
                "no cancel command known for '{}'; set BATCH_CANCEL",
                self.submit_cmd
            )));
        };
        run_capture(cancel_cmd, &[backend_ref.to_string()], None).await?;
        tracing::info!("Cancelled CPU{:04} (job {})", slot, backend_ref);
        Ok(())
    }
}
