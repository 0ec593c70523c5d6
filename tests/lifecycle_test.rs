//! Run lifecycle tests
//!
//! Drives prepare, submit, merge and kill against a recording backend:
//! - Dry runs write exactly what a real run writes
//! - Output-area protection and retry after a failed prepare
//! - Partial failure, fail-fast and merge idempotence
//! - Kill on live, finished and missing runs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use submit_batch::backend::mock::RecordingBackend;
use submit_batch::backend::{BackendResult, ScriptBatch, SubmitReceipt};
use submit_batch::ledger::{LockPolicy, MergeLock, Transition};
use submit_batch::scripts::RunLayout;
use submit_batch::{
    kill_run, FinalOutcome, KillReport, LaunchEnv, MergeLedger, MergeMode, MergeReport,
    Orchestrator, RunConfig, RunOptions, RunOutcome, RunSnapshot, RunState, SubmissionBackend,
    SubmitError, TaskState,
};
use tempfile::TempDir;

const FIT_INPUT: &str = "\
CONFIG:
  VERSION: [DES, LOWZ, FOUND]
  OUTDIR: FIT_OUT
  NCORE: 2
";

fn env(dir: &Path) -> LaunchEnv {
    LaunchEnv {
        launch_dir: dir.to_path_buf(),
        data_root: Some(PathBuf::from("/data/snroot")),
        exe: PathBuf::from("/opt/bin/submit_batch"),
    }
}

fn config(dir: &Path, text: &str, options: RunOptions) -> Result<RunConfig> {
    let path = dir.join("fit.yml");
    std::fs::write(&path, text)?;
    Ok(RunConfig::load(&path, options, env(dir))?)
}

/// What a generated merge trigger does: find the run by its output
/// directory and rebuild the configuration from its snapshot
async fn merge_config(dir: &Path, output_dir: &Path, options: RunOptions) -> Result<RunConfig> {
    let located = RunSnapshot::locate(output_dir, &env(dir), &options)?;
    let snapshot = RunSnapshot::load(&located).await?;
    Ok(RunConfig::from_snapshot(&snapshot, options, env(dir)))
}

fn trigger(token: i64, slot: u32, merge: MergeMode) -> RunOptions {
    RunOptions {
        merge,
        run_token: Some(token),
        cpunum: Some(slot),
        ..RunOptions::default()
    }
}

fn finish(layout: &RunLayout, task_id: &str, marker: &str) -> Result<()> {
    std::fs::write(layout.done_marker(task_id), format!("{}\n", marker))?;
    Ok(())
}

fn read_scripts(layout: &RunLayout) -> Result<Vec<(String, String)>> {
    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(&layout.script_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "CMD") {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            scripts.push((name, std::fs::read_to_string(&path)?));
        }
    }
    scripts.sort();
    Ok(scripts)
}

// ============================================================================
// Prepare
// ============================================================================

#[tokio::test]
async fn test_dry_run_matches_real_run() -> Result<()> {
    let dry_dir = TempDir::new()?;
    let real_dir = TempDir::new()?;

    let dry_cfg = config(
        dry_dir.path(),
        FIT_INPUT,
        RunOptions {
            nosubmit: true,
            ..RunOptions::default()
        },
    )?;
    let dry = Orchestrator::new(&dry_cfg)?;
    let RunOutcome::DryRun(dry_prepared) = dry.run().await? else {
        panic!("--nosubmit must not submit");
    };

    let real_cfg = config(real_dir.path(), FIT_INPUT, RunOptions::default())?;
    let backend = Arc::new(RecordingBackend::new());
    let real = Orchestrator::new(&real_cfg)?.with_backend(backend.clone());
    let RunOutcome::Submitted { prepared: real_prepared, .. } = real.run().await? else {
        panic!("expected a submission");
    };

    // scripts differ only in paths and the run token
    let normalize = |s: &str, dir: &Path, token: i64| {
        s.replace(&dir.to_string_lossy().to_string(), "<DIR>")
            .replace(&token.to_string(), "<TOKEN>")
    };
    let dry_scripts = read_scripts(dry.layout())?;
    let real_scripts = read_scripts(real.layout())?;
    assert_eq!(dry_scripts.len(), 2);
    assert_eq!(dry_scripts.len(), real_scripts.len());
    for ((dn, ds), (rn, rs)) in dry_scripts.iter().zip(&real_scripts) {
        assert_eq!(dn, rn);
        assert_eq!(
            normalize(ds, dry_dir.path(), dry_prepared.snapshot.run_token),
            normalize(rs, real_dir.path(), real_prepared.snapshot.run_token)
        );
    }

    let dry_ids: Vec<_> = dry_prepared.snapshot.tasks.iter().map(|t| (&t.id, t.slot)).collect();
    let real_ids: Vec<_> = real_prepared.snapshot.tasks.iter().map(|t| (&t.id, t.slot)).collect();
    assert_eq!(dry_ids, real_ids);

    // dry run: PREPARED, all WAIT; real run: SUBMITTED, all past WAIT
    assert_eq!(dry.run_state().await?, RunState::Prepared);
    let dry_doc = submit_batch::MergeLedger::new(&dry.layout().output_dir, Default::default())
        .snapshot()
        .await?;
    assert_eq!(dry_doc.counts().wait, 3);

    let real_doc = submit_batch::MergeLedger::new(&real.layout().output_dir, Default::default())
        .snapshot()
        .await?;
    assert_eq!(real_doc.counts().run, 3);
    assert!(matches!(real_doc.state, RunState::Submitted | RunState::Merging));
    assert_eq!(backend.submitted().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_existing_output_needs_overwrite() -> Result<()> {
    let tmp = TempDir::new()?;
    std::fs::create_dir_all(tmp.path().join("FIT_OUT"))?;
    std::fs::write(tmp.path().join("FIT_OUT/keep.txt"), "user data")?;

    let cfg = config(tmp.path(), FIT_INPUT, RunOptions::default())?;
    let err = Orchestrator::new(&cfg)?.prepare().await.unwrap_err();
    assert!(matches!(err, SubmitError::OutputExists { .. }));
    assert!(tmp.path().join("FIT_OUT/keep.txt").exists());

    let cfg = config(
        tmp.path(),
        FIT_INPUT,
        RunOptions {
            overwrite: true,
            ..RunOptions::default()
        },
    )?;
    let orch = Orchestrator::new(&cfg)?;
    orch.prepare().await?;
    assert!(!tmp.path().join("FIT_OUT/keep.txt").exists());
    assert_eq!(orch.run_state().await?, RunState::Prepared);
    Ok(())
}

#[tokio::test]
async fn test_incomplete_prepare_can_be_retried() -> Result<()> {
    let tmp = TempDir::new()?;
    let scheduled = format!(
        "{}  BATCH_INFO: sbatch {} 2\n",
        FIT_INPUT.replace("  NCORE: 2\n", ""),
        tmp.path().join("missing.TEMPLATE").display()
    );

    // template is missing: prepare fails after claiming the directory
    let cfg = config(tmp.path(), &scheduled, RunOptions::default())?;
    let orch = Orchestrator::new(&cfg)?;
    let err = orch.prepare().await.unwrap_err();
    assert!(matches!(err, SubmitError::InvalidConfig(_)));
    assert!(orch.layout().incomplete_marker().exists());
    assert_eq!(orch.run_state().await?, RunState::Uninitialized);

    // retry without --overwrite succeeds once the template exists
    std::fs::write(tmp.path().join("missing.TEMPLATE"), "REPLACE_JOB\n")?;
    let cfg = config(tmp.path(), &scheduled, RunOptions::default())?;
    let orch = Orchestrator::new(&cfg)?;
    let prepared = orch.prepare().await?;
    assert!(prepared.batches.iter().all(|b| b.batch_script.is_some()));
    assert!(!orch.layout().incomplete_marker().exists());
    Ok(())
}

// ============================================================================
// Merge
// ============================================================================

#[tokio::test]
async fn test_partial_failure_is_tolerated() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(
        tmp.path(),
        FIT_INPUT,
        RunOptions {
            nomerge: true,
            ..RunOptions::default()
        },
    )?;
    let orch = Orchestrator::new(&cfg)?.with_backend(Arc::new(RecordingBackend::new()));
    orch.run().await?;

    let layout = orch.layout().clone();
    finish(&layout, "DES-FITOPT000", "SUCCESS")?;
    finish(&layout, "LOWZ-FITOPT000", "FAILURE")?;
    finish(&layout, "FOUND-FITOPT000", "SUCCESS")?;

    let report = orch.merge_pass().await?;
    let doc = report.doc().expect("merge pass should not be abandoned");
    assert_eq!(doc.state, RunState::Final);
    assert_eq!(doc.outcome, Some(FinalOutcome::Done));
    assert_eq!(doc.failure_count, 1);
    assert_eq!(doc.counts().done, 2);
    Ok(())
}

#[tokio::test]
async fn test_fail_fast_marks_run_failed() -> Result<()> {
    let tmp = TempDir::new()?;
    let text = format!("{}  FAIL_FAST: true\n", FIT_INPUT);
    let cfg = config(
        tmp.path(),
        &text,
        RunOptions {
            nomerge: true,
            ..RunOptions::default()
        },
    )?;
    let orch = Orchestrator::new(&cfg)?.with_backend(Arc::new(RecordingBackend::new()));
    orch.run().await?;

    let layout = orch.layout().clone();
    finish(&layout, "DES-FITOPT000", "SUCCESS")?;
    finish(&layout, "LOWZ-FITOPT000", "FAILURE")?;
    finish(&layout, "FOUND-FITOPT000", "SUCCESS")?;

    let report = orch.merge_pass().await?;
    assert_eq!(report.doc().and_then(|d| d.outcome), Some(FinalOutcome::Failed));
    assert_eq!(std::fs::read_to_string(layout.all_done())?, "FAILURE\n");
    Ok(())
}

#[tokio::test]
async fn test_merge_on_final_run_is_noop() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(tmp.path(), FIT_INPUT, RunOptions::default())?;
    let orch = Orchestrator::new(&cfg)?.with_backend(Arc::new(RecordingBackend::new()));

    let layout = orch.layout().clone();
    let prepared = orch.prepare().await?;
    orch.submit(&prepared).await?;
    for task in &prepared.snapshot.tasks {
        finish(&layout, &task.id, "SUCCESS")?;
    }
    let final_report = orch.merge_pass().await?;
    assert!(final_report.is_final());
    let before = std::fs::read_to_string(layout.output_dir.join("MERGE.LOG"))?;

    let merge_cfg = config(
        tmp.path(),
        FIT_INPUT,
        RunOptions {
            merge: MergeMode::Single,
            run_token: Some(prepared.snapshot.run_token),
            cpunum: Some(1),
            ..RunOptions::default()
        },
    )?;
    let merger = Orchestrator::new(&merge_cfg)?;
    for _ in 0..3 {
        assert!(matches!(merger.merge_pass().await?, MergeReport::NoOp(_)));
    }
    assert_eq!(std::fs::read_to_string(layout.output_dir.join("MERGE.LOG"))?, before);
    Ok(())
}

#[tokio::test]
async fn test_pending_tasks_keep_run_open() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(tmp.path(), FIT_INPUT, RunOptions::default())?;
    let orch = Orchestrator::new(&cfg)?.with_backend(Arc::new(RecordingBackend::new()));
    let prepared = orch.prepare().await?;
    orch.submit(&prepared).await?;

    finish(orch.layout(), "DES-FITOPT000", "SUCCESS")?;
    let report = orch.merge_pass().await?;
    let doc = report.doc().expect("not abandoned");
    assert_eq!(doc.state, RunState::Merging);
    assert_eq!(doc.task("DES-FITOPT000").map(|t| t.state), Some(TaskState::Done));
    assert_eq!(doc.counts().run, 2);
    assert!(!orch.layout().all_done().exists());
    Ok(())
}

// ============================================================================
// Kill
// ============================================================================

#[tokio::test]
async fn test_kill_is_idempotent() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(tmp.path(), FIT_INPUT, RunOptions::default())?;
    let backend = Arc::new(RecordingBackend::new());
    let orch = Orchestrator::new(&cfg)?.with_backend(backend.clone());
    let prepared = orch.prepare().await?;
    orch.submit(&prepared).await?;

    let KillReport::Killed { killed, doc, .. } = kill_run(&orch).await? else {
        panic!("expected tasks to kill");
    };
    assert_eq!(killed.len(), 3);
    assert_eq!(doc.outcome, Some(FinalOutcome::Killed));
    assert_eq!(backend.cancelled().len(), 2);

    assert!(matches!(kill_run(&orch).await?, KillReport::NothingToKill));
    assert!(matches!(orch.merge_pass().await?, MergeReport::NoOp(_)));
    assert_eq!(backend.cancelled().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_kill_prepared_run() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(tmp.path(), FIT_INPUT, RunOptions::default())?;
    let backend = Arc::new(RecordingBackend::new());
    let orch = Orchestrator::new(&cfg)?.with_backend(backend.clone());
    orch.prepare().await?;

    // WAIT tasks have no backend reference, so nothing is cancelled
    let KillReport::Killed { killed, doc, .. } = kill_run(&orch).await? else {
        panic!("expected tasks to kill");
    };
    assert_eq!(killed.len(), 3);
    assert!(doc.is_final());
    assert!(backend.cancelled().is_empty());
    Ok(())
}

// ============================================================================
// Merge Triggers
// ============================================================================

#[tokio::test]
async fn test_merge_ignores_later_input_edits() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(tmp.path(), FIT_INPUT, RunOptions::default())?;
    let orch = Orchestrator::new(&cfg)?.with_backend(Arc::new(RecordingBackend::new()));
    let prepared = orch.prepare().await?;
    orch.submit(&prepared).await?;
    let layout = orch.layout().clone();

    for (_, script) in read_scripts(&layout)? {
        assert!(script.contains(&format!("{} -m -t", layout.output_dir.display())));
        assert!(!script.contains("fit.yml"));
    }

    // the input is reused for the next run, with a key that is now rejected
    std::fs::write(
        tmp.path().join("fit.yml"),
        "CONFIG:\n  VERSION: [OTHER]\n  OUTDIR: NEXT_OUT\n  NODELIST_SSH: n1\n",
    )?;
    for task in &prepared.snapshot.tasks {
        finish(&layout, &task.id, "SUCCESS")?;
    }

    let merge_cfg = merge_config(
        tmp.path(),
        &layout.output_dir,
        trigger(prepared.snapshot.run_token, 0, MergeMode::Single),
    )
    .await?;
    let merger = Orchestrator::for_output_dir(&merge_cfg, layout.output_dir.clone());
    let report = merger.merge_pass().await?;
    assert!(report.is_final());
    assert_eq!(report.doc().map(|d| d.counts().done), Some(3));
    assert!(!tmp.path().join("NEXT_OUT").exists());
    Ok(())
}

const CONTENDED_INPUT: &str = "\
CONFIG:
  VERSION: [DES, LOWZ, FOUND]
  OUTDIR: FIT_OUT
  NCORE: 2
  MERGE_LOCK_WAIT_SEC: 1
  MERGE_LOCK_STALE_SEC: 30
  MERGE_RECHECK_SEC: 1
";

#[tokio::test]
async fn test_full_merge_finishes_after_abandoned_trigger() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(tmp.path(), CONTENDED_INPUT, RunOptions::default())?;
    let orch = Orchestrator::new(&cfg)?.with_backend(Arc::new(RecordingBackend::new()));
    let prepared = orch.prepare().await?;
    orch.submit(&prepared).await?;
    let layout = orch.layout().clone();
    let token = prepared.snapshot.run_token;

    for task in &prepared.snapshot.tasks {
        finish(&layout, &task.id, "SUCCESS")?;
    }

    // another merger holds the ledger while the last task's trigger runs
    let policy = LockPolicy {
        wait: Duration::from_secs(1),
        stale_after: Duration::from_secs(30),
    };
    let busy = MergeLedger::new(&layout.output_dir, policy).busy_path();
    let held = MergeLock::acquire(&busy, Some(7), &policy).await?;

    let single_cfg = merge_config(tmp.path(), &layout.output_dir, trigger(token, 1, MergeMode::Single)).await?;
    let single = Orchestrator::for_output_dir(&single_cfg, layout.output_dir.clone());
    assert!(matches!(single.merge_pass().await?, MergeReport::Abandoned { .. }));
    assert_ne!(single.run_state().await?, RunState::Final);

    // the slot's closing full merge outlasts the holder
    let full_cfg = merge_config(tmp.path(), &layout.output_dir, trigger(token, 1, MergeMode::Full)).await?;
    let full = Orchestrator::for_output_dir(&full_cfg, layout.output_dir.clone());
    let release = async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(held);
    };
    let (report, ()) = tokio::time::timeout(Duration::from_secs(30), async {
        tokio::join!(full.full_merge(), release)
    })
    .await?;

    let report = report?;
    assert!(report.is_final());
    assert_eq!(std::fs::read_to_string(layout.all_done())?, "SUCCESS\n");
    Ok(())
}

#[tokio::test]
async fn test_full_merge_stops_on_unsubmitted_run() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(
        tmp.path(),
        CONTENDED_INPUT,
        RunOptions {
            nosubmit: true,
            ..RunOptions::default()
        },
    )?;
    let orch = Orchestrator::new(&cfg)?;
    orch.run().await?;

    let manual = RunOptions {
        merge: MergeMode::Full,
        ..RunOptions::default()
    };
    let merge_cfg = merge_config(tmp.path(), &orch.layout().output_dir, manual).await?;
    let merger = Orchestrator::for_output_dir(&merge_cfg, orch.layout().output_dir.clone());
    let report = tokio::time::timeout(Duration::from_secs(10), merger.full_merge()).await??;

    let MergeReport::Stalled { doc, .. } = report else {
        panic!("expected the merge to stop, got {:?}", report);
    };
    assert_eq!(doc.state, RunState::Prepared);
    assert_eq!(doc.counts().wait, 3);
    Ok(())
}

#[tokio::test]
async fn test_full_merge_stops_on_superseded_token() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(tmp.path(), CONTENDED_INPUT, RunOptions::default())?;
    let orch = Orchestrator::new(&cfg)?.with_backend(Arc::new(RecordingBackend::new()));
    let prepared = orch.prepare().await?;
    orch.submit(&prepared).await?;

    let stale = trigger(prepared.snapshot.run_token - 1, 0, MergeMode::Full);
    let merge_cfg = merge_config(tmp.path(), &orch.layout().output_dir, stale).await?;
    let merger = Orchestrator::for_output_dir(&merge_cfg, orch.layout().output_dir.clone());
    let report = tokio::time::timeout(Duration::from_secs(10), merger.full_merge()).await??;
    assert!(matches!(report, MergeReport::Abandoned { .. }));
    Ok(())
}

// ============================================================================
// Submission Races
// ============================================================================

/// Accepts every batch, then runs `during` as if another process acted
/// between the backend's answer and the driver's ledger record
struct InterruptingBackend {
    inner: Arc<RecordingBackend>,
    output_dir: PathBuf,
    action: Interruption,
}

enum Interruption {
    /// Kill slot 0's tasks
    KillFirstSlot,
    /// Remove the run snapshot
    LoseSnapshot,
}

#[async_trait]
impl SubmissionBackend for InterruptingBackend {
    fn name(&self) -> &'static str {
        "interrupting"
    }

    async fn submit(&self, batch: &ScriptBatch) -> BackendResult<SubmitReceipt> {
        let receipt = self.inner.submit(batch).await?;
        match self.action {
            Interruption::KillFirstSlot if batch.slot == 0 => {
                let ledger = MergeLedger::new(&self.output_dir, LockPolicy::default());
                let kills: Vec<Transition> = batch
                    .task_ids
                    .iter()
                    .map(|id| Transition::new(id, TaskState::Wait, TaskState::Killed))
                    .collect();
                ledger
                    .apply(&kills)
                    .await
                    .map_err(|e| submit_batch::BackendError::Unsupported(e.to_string()))?;
            }
            Interruption::LoseSnapshot => {
                std::fs::remove_file(RunSnapshot::path(&self.output_dir)).ok();
            }
            Interruption::KillFirstSlot => {}
        }
        Ok(receipt)
    }

    async fn cancel(&self, slot: u32, backend_ref: &str) -> BackendResult<()> {
        self.inner.cancel(slot, backend_ref).await
    }
}

#[tokio::test]
async fn test_kill_during_submission_cancels_batch() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(
        tmp.path(),
        FIT_INPUT,
        RunOptions {
            nomerge: true,
            ..RunOptions::default()
        },
    )?;
    let recording = Arc::new(RecordingBackend::new());
    let orch = Orchestrator::new(&cfg)?;
    let backend = InterruptingBackend {
        inner: recording.clone(),
        output_dir: orch.layout().output_dir.clone(),
        action: Interruption::KillFirstSlot,
    };
    let orch = orch.with_backend(Arc::new(backend));

    let prepared = orch.prepare().await?;
    let report = orch.submit(&prepared).await?;
    assert_eq!(report.accepted_slots, vec![0, 1]);
    assert_eq!(recording.cancelled(), vec![(0, "mock-0".to_string())]);

    let doc = MergeLedger::new(&orch.layout().output_dir, LockPolicy::default())
        .snapshot()
        .await?;
    for task in &doc.tasks {
        let expected = if task.slot == 0 { TaskState::Killed } else { TaskState::Run };
        assert_eq!(task.state, expected, "task {}", task.id);
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_merge_after_submit_keeps_report() -> Result<()> {
    let tmp = TempDir::new()?;
    let cfg = config(tmp.path(), FIT_INPUT, RunOptions::default())?;
    let recording = Arc::new(RecordingBackend::new());
    let orch = Orchestrator::new(&cfg)?;
    let backend = InterruptingBackend {
        inner: recording.clone(),
        output_dir: orch.layout().output_dir.clone(),
        action: Interruption::LoseSnapshot,
    };
    let orch = orch.with_backend(Arc::new(backend));

    let RunOutcome::Submitted { report, merge, .. } = orch.run().await? else {
        panic!("expected a submission");
    };
    assert_eq!(report.accepted_slots.len(), 2);
    assert!(matches!(merge, Some(MergeReport::Abandoned { .. })));
    assert_eq!(recording.submitted().len(), 2);
    Ok(())
}
