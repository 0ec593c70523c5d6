//! Kill controller
//!
//! Cancels every slot batch that still has outstanding work, then records
//! the kill in the ledger. Cancellation is best-effort; the ledger update is
//! not.

use std::collections::BTreeMap;

use futures::future::join_all;

use crate::error::{Result, SubmitError};
use crate::ledger::{ExitOutcome, LedgerDoc, TaskState, Transition};
use crate::orchestrator::{write_all_done, Orchestrator};
use crate::snapshot::RunSnapshot;

#[derive(Debug, Clone)]
pub enum KillReport {
    /// No ledger, or no task left to stop
    NothingToKill,
    Killed {
        /// Tasks moved to KILLED
        killed: Vec<String>,
        /// Slots the backend failed to cancel
        cancel_failures: Vec<u32>,
        doc: LedgerDoc,
    },
}

pub async fn kill_run(orch: &Orchestrator<'_>) -> Result<KillReport> {
    let layout = orch.layout();
    let snapshot = match RunSnapshot::load(&layout.output_dir).await {
        Ok(snapshot) => snapshot,
        Err(SubmitError::SnapshotMissing { .. }) => {
            tracing::info!("No run found in {:?}; nothing to kill", layout.output_dir);
            return Ok(KillReport::NothingToKill);
        }
        Err(e) => return Err(e),
    };

    let ledger = orch.driver_ledger(&snapshot.settings);
    let current = match ledger.snapshot().await {
        Ok(doc) => doc,
        Err(SubmitError::LedgerMissing { .. }) => {
            tracing::info!("No ledger in {:?}; nothing to kill", layout.output_dir);
            return Ok(KillReport::NothingToKill);
        }
        Err(e) => return Err(e),
    };

    // one backend ref per slot with outstanding tasks
    let mut targets: BTreeMap<u32, Option<String>> = BTreeMap::new();
    for task in current.tasks.iter().filter(|t| !t.state.is_terminal()) {
        let entry = targets.entry(task.slot).or_insert(None);
        if entry.is_none() {
            *entry = task.backend_ref.clone();
        }
    }
    if targets.is_empty() {
        tracing::info!("All tasks of {} already ended; nothing to kill", current.run_id);
        return Ok(KillReport::NothingToKill);
    }

    let backend = orch.backend_for(&snapshot.backend);
    let cancels = targets.iter().filter_map(|(slot, backend_ref)| {
        let backend = backend.clone();
        backend_ref.as_ref().map(|r| async move { (*slot, backend.cancel(*slot, r).await) })
    });
    let mut cancel_failures = Vec::new();
    for (slot, result) in join_all(cancels).await {
        if let Err(e) = result {
            tracing::warn!("Could not cancel CPU{:04}: {}", slot, e);
            cancel_failures.push(slot);
        }
    }

    let fail_fast = snapshot.settings.fail_fast;
    let outcome = ledger
        .update(|doc| {
            // re-read inside the lock: a task may have finished meanwhile
            let transitions: Vec<Transition> = doc
                .tasks
                .iter()
                .filter(|t| !t.state.is_terminal())
                .map(|t| {
                    Transition::new(&t.id, t.state, TaskState::Killed)
                        .with_outcome(ExitOutcome::Killed)
                        .with_reason("killed by user")
                })
                .collect();
            doc.apply(&transitions)?;

            let killed: Vec<String> = transitions.into_iter().map(|t| t.task_id).collect();
            // every task is terminal now; any KILLED one makes the run KILLED
            doc.finalize(fail_fast);
            Ok((killed, doc.clone()))
        })
        .await?;

    let (killed, doc) = outcome;
    if doc.is_final() {
        write_all_done(layout, &doc).await?;
    }
    tracing::info!("Killed {} task(s) of run {}", killed.len(), doc.run_id);

    Ok(KillReport::Killed {
        killed,
        cancel_failures,
        doc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::RecordingBackend;
    use crate::ledger::FinalOutcome;
    use crate::config::{LaunchEnv, RunConfig, RunOptions};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config(dir: &Path) -> RunConfig {
        RunConfig::from_text(
            dir.join("fit.yml"),
            "CONFIG:\n  VERSION: [A, B]\n  OUTDIR: OUT\n  NCORE: 2\n".to_string(),
            RunOptions::default(),
            LaunchEnv {
                launch_dir: dir.to_path_buf(),
                data_root: None,
                exe: PathBuf::from("submit_batch"),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_kill_without_run() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let orch = Orchestrator::new(&cfg).unwrap();
        assert!(matches!(kill_run(&orch).await.unwrap(), KillReport::NothingToKill));
    }

    #[tokio::test]
    async fn test_kill_keeps_finished_tasks() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let backend = Arc::new(RecordingBackend::new());
        let orch = Orchestrator::new(&cfg).unwrap().with_backend(backend.clone());

        let prepared = orch.prepare().await.unwrap();
        orch.submit(&prepared).await.unwrap();
        std::fs::write(orch.layout().done_marker("A-FITOPT000"), "SUCCESS\n").unwrap();
        orch.merge_pass().await.unwrap();

        let KillReport::Killed { killed, doc, .. } = kill_run(&orch).await.unwrap() else {
            panic!("expected a kill");
        };
        assert_eq!(killed, vec!["B-FITOPT000".to_string()]);
        assert_eq!(doc.task("A-FITOPT000").unwrap().state, TaskState::Done);
        assert_eq!(doc.outcome, Some(FinalOutcome::Killed));
        assert_eq!(backend.cancelled(), vec![(1, "mock-1".to_string())]);

        // second kill is a no-op
        assert!(matches!(kill_run(&orch).await.unwrap(), KillReport::NothingToKill));
    }
}
