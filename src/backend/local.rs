use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{BackendError, BackendResult, ScriptBatch, SubmissionBackend, SubmitReceipt};

/// Runs each slot batch as a detached process group on this machine
#[derive(Debug, Clone)]
pub struct LocalBackend {
    shell: String,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    fn command(&self, batch: &ScriptBatch) -> BackendResult<Command> {
        let log = std::fs::File::create(&batch.log_file)?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(&self.shell);
        cmd.arg(&batch.cmd_script)
            .current_dir(&batch.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // own process group, so cancel can signal the whole batch
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        Ok(Command::from(cmd))
    }
}

#[async_trait]
impl SubmissionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, batch: &ScriptBatch) -> BackendResult<SubmitReceipt> {
        let mut cmd = self.command(batch)?;
        tracing::debug!("Launching CPU{:04}: {:?}", batch.slot, cmd);

        let child = cmd.spawn().map_err(|source| BackendError::Spawn {
            program: self.shell.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| {
            BackendError::MissingReference(format!("CPU{:04} exited before reporting a pid", batch.slot))
        })?;

        // the batch outlives this process; it reports through done markers
        drop(child);

        Ok(SubmitReceipt {
            slot: batch.slot,
            backend_ref: pid.to_string(),
        })
    }

    #[cfg(unix)]
    async fn cancel(&self, slot: u32, backend_ref: &str) -> BackendResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid: i32 = backend_ref
            .trim()
            .parse()
            .map_err(|_| BackendError::MissingReference(backend_ref.to_string()))?;

        match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
            Ok(()) => {
                tracing::info!("Sent SIGTERM to CPU{:04} (process group {})", slot, pgid);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                tracing::debug!("CPU{:04} process group {} already gone", slot, pgid);
                Ok(())
            }
            Err(e) => Err(BackendError::Io(std::io::Error::from(e))),
        }
    }

    #[cfg(not(unix))]
    async fn cancel(&self, slot: u32, _backend_ref: &str) -> BackendResult<()> {
        Err(BackendError::Unsupported(format!(
            "cannot signal CPU{:04} on this platform",
            slot
        )))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_submit_runs_script_detached() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("CPU0000_JOBLIST.CMD");
        let marker = tmp.path().join("ran");
        std::fs::write(&script, format!("touch {}\n", marker.display())).unwrap();

        let batch = ScriptBatch {
            slot: 0,
            cmd_script: script,
            batch_script: None,
            log_file: tmp.path().join("CPU0000_JOBLIST.LOG"),
            work_dir: tmp.path().to_path_buf(),
            task_ids: vec!["t0".to_string()],
        };

        let receipt = LocalBackend::new().submit(&batch).await.unwrap();
        assert_eq!(receipt.slot, 0);
        assert!(receipt.backend_ref.parse::<u32>().is_ok());

        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_cancel_finished_batch_is_ok() {
        // pid far above any default pid_max
        let result = LocalBackend::new().cancel(0, "999999999").await;
        assert!(result.is_ok());
    }
}
