//! Run lifecycle driver
//!
//! Sequences prepare, submit and merge for one run. Every step reads and
//! writes the output area only; a merge invocation started by a finished
//! task finds the run by its output directory and builds its own
//! `Orchestrator` from the run snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use crate::backend::{BackendSpec, ScriptBatch, SubmissionBackend, TaskOutcome};
use crate::config::{MergeSettings, RunConfig};
use crate::error::{Result, SubmitError};
use crate::ledger::{
    ExitOutcome, FinalOutcome, LedgerDoc, LedgerTask, LockPolicy, MergeLedger, RunMeta, RunState,
    TaskState, Transition,
};
use crate::planner::plan_tasks;
use crate::scripts::{assign_slots, write_scripts, RunLayout, ScriptContext};
use crate::snapshot::{RunSnapshot, SnapshotTask};

/// Result of a successful prepare
#[derive(Debug, Clone)]
pub struct Prepared {
    pub snapshot: RunSnapshot,
    pub batches: Vec<ScriptBatch>,
}

/// Result of handing every batch to the backend
#[derive(Debug)]
pub struct SubmitReport {
    pub n_tasks: usize,
    pub accepted_slots: Vec<u32>,
    /// One error per rejected slot; their tasks are FAIL in the ledger
    pub rejected: Vec<SubmitError>,
}

/// What the driver did for a plain (non-merge) invocation
#[derive(Debug)]
pub enum RunOutcome {
    /// `--nosubmit`: output area prepared, nothing submitted
    DryRun(Prepared),
    Submitted {
        prepared: Prepared,
        report: SubmitReport,
        merge: Option<MergeReport>,
    },
}

/// Outcome of one merge pass
#[derive(Debug, Clone)]
pub enum MergeReport {
    /// Ledger updated (possibly with zero new outcomes)
    Advanced { applied: usize, doc: LedgerDoc },
    /// Run already FINAL; nothing written
    NoOp(LedgerDoc),
    /// Pass gave up without writing, the next trigger will retry
    Abandoned { reason: String },
    /// No merge pass can finish the run as it stands
    Stalled { reason: String, doc: LedgerDoc },
}

impl MergeReport {
    pub fn doc(&self) -> Option<&LedgerDoc> {
        match self {
            MergeReport::Advanced { doc, .. }
            | MergeReport::NoOp(doc)
            | MergeReport::Stalled { doc, .. } => Some(doc),
            MergeReport::Abandoned { .. } => None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.doc().is_some_and(LedgerDoc::is_final)
    }
}

pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    layout: RunLayout,
    /// Replaces the backend named in the configuration
    backend: Option<Arc<dyn SubmissionBackend>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a RunConfig) -> Result<Self> {
        Ok(Self::for_output_dir(config, config.output_dir()?))
    }

    /// Driver for an existing run found by its output directory
    pub fn for_output_dir(config: &'a RunConfig, output_dir: PathBuf) -> Self {
        Self {
            config,
            layout: RunLayout::new(output_dir, config.variant),
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn SubmissionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(&self) -> &RunConfig {
        self.config
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub(crate) fn backend_for(&self, spec: &BackendSpec) -> Arc<dyn SubmissionBackend> {
        match &self.backend {
            Some(backend) => Arc::clone(backend),
            None => spec.build(),
        }
    }

    /// Ledger handle for merge passes: bounded lock wait
    pub(crate) fn merge_ledger(&self, settings: &MergeSettings) -> MergeLedger {
        MergeLedger::new(
            &self.layout.output_dir,
            LockPolicy {
                wait: settings.lock_wait(),
                stale_after: settings.stale_after(),
            },
        )
        .with_worker(self.config.options.cpunum)
    }

    /// Ledger handle for the driver: waits as long as a live holder can
    pub(crate) fn driver_ledger(&self, settings: &MergeSettings) -> MergeLedger {
        self.merge_ledger(settings).with_wait(settings.stale_after())
    }

    /// Prepare, submit, then run one merge pass
    pub async fn run(&self) -> Result<RunOutcome> {
        let prepared = self.prepare().await?;
        if self.config.options.nosubmit {
            tracing::info!("--nosubmit: prepared {} tasks, nothing submitted", prepared.snapshot.tasks.len());
            return Ok(RunOutcome::DryRun(prepared));
        }

        let report = self.submit(&prepared).await?;
        let merge = if self.config.options.nomerge {
            None
        } else {
            // picks up tasks that finished before their RUN record existed;
            // the jobs are out either way, so a failed pass does not fail the run
            match self.merge_pass().await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!("Merge pass after submit failed: {}", e);
                    Some(MergeReport::Abandoned {
                        reason: e.to_string(),
                    })
                }
            }
        };

        Ok(RunOutcome::Submitted {
            prepared,
            report,
            merge,
        })
    }

    /// UNINITIALIZED → PREPARED
    pub async fn prepare(&self) -> Result<Prepared> {
        let config = self.config;
        let layout = &self.layout;

        let backend = BackendSpec::from_config(config)?;
        let planned = plan_tasks(config, &layout.script_dir)?;
        let slots = assign_slots(planned.len(), backend.n_slots());

        self.claim_output_dir().await?;

        let run_token = Utc::now().timestamp();
        let run_id = format!(
            "{}-{}",
            config.variant.tag(),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let ctx = ScriptContext {
            config,
            layout,
            backend: &backend,
            run_token,
        };
        let batches = write_scripts(&ctx, &planned, &slots).await?;

        let snapshot = RunSnapshot {
            run_id: run_id.clone(),
            run_token,
            variant: config.variant,
            input_file: config.input_file.clone(),
            legacy: config.legacy,
            input_text: config.input_text.clone(),
            launch_dir: config.env.launch_dir.clone(),
            output_dir: layout.output_dir.clone(),
            config: config.config.clone(),
            options: config.options.clone(),
            settings: config.settings.clone(),
            n_slots: backend.n_slots(),
            backend,
            tasks: planned
                .iter()
                .zip(&slots)
                .map(|(t, slot)| SnapshotTask {
                    id: t.id.clone(),
                    slot: *slot,
                })
                .collect(),
            created_at: Utc::now(),
        };

        let meta = RunMeta {
            run_id,
            variant: config.variant,
            output_dir: layout.output_dir.clone(),
        };
        self.driver_ledger(&config.settings)
            .initialize(meta, snapshot.ledger_tasks())
            .await?;
        snapshot.write(&layout.output_dir).await?;

        fs::remove_file(layout.incomplete_marker()).await?;
        tracing::info!("Prepared run {} in {:?}", snapshot.run_id, layout.output_dir);

        Ok(Prepared { snapshot, batches })
    }

    /// Create a fresh output directory carrying the incomplete marker
    async fn claim_output_dir(&self) -> Result<()> {
        let dir = &self.layout.output_dir;

        if fs::try_exists(dir).await? {
            let incomplete = fs::try_exists(self.layout.incomplete_marker()).await?;
            if !(self.config.options.overwrite || incomplete) {
                return Err(SubmitError::OutputExists { path: dir.clone() });
            }
            if incomplete {
                tracing::warn!("Redoing incomplete prepare in {:?}", dir);
            } else {
                tracing::info!("Overwriting {:?}", dir);
            }
            fs::remove_dir_all(dir).await?;
        }

        fs::create_dir_all(dir).await?;
        fs::write(self.layout.incomplete_marker(), b"").await?;
        Ok(())
    }

    /// PREPARED → SUBMITTED
    pub async fn submit(&self, prepared: &Prepared) -> Result<SubmitReport> {
        let snapshot = &prepared.snapshot;
        let backend = self.backend_for(&snapshot.backend);
        let ledger = self.driver_ledger(&snapshot.settings);

        let mut accepted_slots = Vec::new();
        let mut rejected = Vec::new();

        for batch in &prepared.batches {
            // Ok(backend ref) or Err(rejection reason)
            let accepted: std::result::Result<String, String> = match backend.submit(batch).await {
                Ok(receipt) => {
                    tracing::info!(
                        "Submitted CPU{:04} ({} tasks) via {}",
                        batch.slot,
                        batch.task_ids.len(),
                        backend.name()
                    );
                    accepted_slots.push(batch.slot);
                    Ok(receipt.backend_ref)
                }
                Err(e) => {
                    tracing::warn!("Backend rejected CPU{:04}: {}", batch.slot, e);
                    let reason = e.to_string();
                    rejected.push(SubmitError::BackendSubmission {
                        slot: batch.slot,
                        source: e,
                    });
                    Err(reason)
                }
            };
            let record = |id: &str| match &accepted {
                Ok(backend_ref) => {
                    Transition::new(id, TaskState::Wait, TaskState::Run).with_backend_ref(backend_ref)
                }
                Err(reason) => Transition::new(id, TaskState::Wait, TaskState::Fail)
                    .with_outcome(ExitOutcome::Rejected)
                    .with_reason(reason),
            };

            // a kill may have landed since the backend accepted the batch
            let killed = ledger
                .update(|doc| {
                    let mut killed = 0;
                    for id in &batch.task_ids {
                        if doc.task(id).map(|t| t.state) == Some(TaskState::Killed) {
                            killed += 1;
                            continue;
                        }
                        doc.transition(&record(id.as_str()))?;
                    }
                    Ok(killed)
                })
                .await?;

            if killed > 0 {
                if let Ok(backend_ref) = &accepted {
                    tracing::warn!("CPU{:04} was killed while being submitted; cancelling it", batch.slot);
                    if let Err(e) = backend.cancel(batch.slot, backend_ref).await {
                        tracing::warn!("Could not cancel CPU{:04}: {}", batch.slot, e);
                    }
                }
            }
        }

        ledger
            .update(|doc| {
                doc.advance_run(RunState::Submitted);
                Ok(())
            })
            .await?;

        Ok(SubmitReport {
            n_tasks: snapshot.tasks.len(),
            accepted_slots,
            rejected,
        })
    }

    /// One merge pass: collect outcomes, advance the ledger, finalize
    pub async fn merge_pass(&self) -> Result<MergeReport> {
        let snapshot = RunSnapshot::load(&self.layout.output_dir).await?;
        if let Err(e) = snapshot.check_token(self.config.options.run_token) {
            tracing::warn!("Abandoning merge: {}", e);
            return Ok(MergeReport::Abandoned {
                reason: e.to_string(),
            });
        }

        let ledger = self.merge_ledger(&snapshot.settings);
        let current = ledger.snapshot().await?;
        if current.is_final() {
            log_summary(&current);
            return Ok(MergeReport::NoOp(current));
        }

        let outcomes = self.collect_outcomes(&snapshot, &current).await;
        let fail_fast = snapshot.settings.fail_fast;

        let result = ledger
            .update(|doc| {
                if doc.is_final() {
                    return Ok(None);
                }
                if doc.state == RunState::Submitted {
                    doc.advance_run(RunState::Merging);
                }

                let mut applied = 0;
                for (task_id, outcome) in &outcomes {
                    // another merger may have recorded it already
                    if doc.task(task_id).map(|t| t.state) != Some(TaskState::Run) {
                        continue;
                    }
                    doc.transition(&outcome_transition(task_id, outcome))?;
                    applied += 1;
                }
                doc.finalize(fail_fast);
                Ok(Some((applied, doc.clone())))
            })
            .await;

        let report = match result {
            Ok(Some((applied, doc))) => {
                if doc.is_final() {
                    write_all_done(&self.layout, &doc).await?;
                }
                MergeReport::Advanced { applied, doc }
            }
            Ok(None) => MergeReport::NoOp(ledger.snapshot().await?),
            Err(e) if e.is_transient() => {
                tracing::warn!("Abandoning merge: {}", e);
                return Ok(MergeReport::Abandoned {
                    reason: e.to_string(),
                });
            }
            Err(e @ SubmitError::InvalidTransition { .. }) => {
                tracing::error!("{}; ledger left untouched, use --merge_reset to rebuild it", e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Some(doc) = report.doc() {
            log_summary(doc);
        }
        Ok(report)
    }

    async fn collect_outcomes(
        &self,
        snapshot: &RunSnapshot,
        doc: &LedgerDoc,
    ) -> Vec<(String, TaskOutcome)> {
        let backend = self.backend_for(&snapshot.backend);
        let mut outcomes = Vec::new();

        for task in doc.in_state(TaskState::Run) {
            match backend.poll(&self.layout.done_marker(&task.id)).await {
                Ok(TaskOutcome::Pending) => {}
                Ok(outcome) => outcomes.push((task.id.clone(), outcome)),
                Err(e) => tracing::warn!("Could not poll {}: {}", task.id, e),
            }
        }
        outcomes
    }

    /// Repeat merge passes until the run is FINAL.
    ///
    /// Stops early when no pass can ever finish the run: the trigger belongs
    /// to a superseded run, or the run was prepared but never submitted.
    pub async fn full_merge(&self) -> Result<MergeReport> {
        let snapshot = RunSnapshot::load(&self.layout.output_dir).await?;
        if let Err(e) = snapshot.check_token(self.config.options.run_token) {
            tracing::warn!("Abandoning merge: {}", e);
            return Ok(MergeReport::Abandoned {
                reason: e.to_string(),
            });
        }
        let interval = snapshot.settings.recheck_interval();

        loop {
            let report = self.merge_pass().await?;
            if report.is_final() {
                return Ok(report);
            }
            if let Some(doc) = report.doc() {
                let internal = self.config.options.run_token.is_some();
                if let Some(reason) = never_finishes(doc, internal, snapshot.settings.stale_after()) {
                    tracing::warn!("Stopping merge: {}", reason);
                    return Ok(MergeReport::Stalled {
                        reason,
                        doc: doc.clone(),
                    });
                }
            }
            tracing::info!("Run not final yet; next merge pass in {:?}", interval);
            tokio::time::sleep(interval).await;
        }
    }

    /// Rebuild the ledger from the snapshot with every task RUN, then merge
    pub async fn merge_reset(&self) -> Result<MergeReport> {
        let snapshot = RunSnapshot::load(&self.layout.output_dir).await?;
        let ledger = self.driver_ledger(&snapshot.settings);

        let now = Utc::now();
        let tasks: Vec<LedgerTask> = snapshot
            .ledger_tasks()
            .into_iter()
            .map(|mut t| {
                t.state = TaskState::Run;
                t.submitted_at = Some(now);
                t
            })
            .collect();

        let mut doc = LedgerDoc::new(
            RunMeta {
                run_id: snapshot.run_id.clone(),
                variant: snapshot.variant,
                output_dir: self.layout.output_dir.clone(),
            },
            tasks,
        );
        doc.advance_run(RunState::Submitted);
        ledger.reset(doc).await?;

        if let Err(e) = fs::remove_file(self.layout.all_done()).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        self.merge_pass().await
    }

    /// Current run state; `Uninitialized` when nothing was prepared
    pub async fn run_state(&self) -> Result<RunState> {
        self.merge_ledger(&self.config.settings).run_state().await
    }
}

fn outcome_transition(task_id: &str, outcome: &TaskOutcome) -> Transition {
    match outcome {
        TaskOutcome::Failure { reason } => Transition::new(task_id, TaskState::Run, TaskState::Fail)
            .with_outcome(ExitOutcome::Failure)
            .with_reason(reason),
        TaskOutcome::Success | TaskOutcome::Pending => {
            Transition::new(task_id, TaskState::Run, TaskState::Done)
        }
    }
}

/// `ALL.DONE` stamp for a FINAL run
/// Why a run that is not FINAL cannot get there by merging alone.
///
/// A script-launched merge (`internal`) may start while the driver is still
/// submitting later slots, so it only gives up once the driver has recorded
/// no submission for `stale_after`.
fn never_finishes(doc: &LedgerDoc, internal: bool, stale_after: Duration) -> Option<String> {
    let waiting = doc.counts().wait;
    if waiting == 0 {
        return None;
    }
    if internal {
        let last_submission = doc
            .tasks
            .iter()
            .filter_map(|t| match t.outcome {
                Some(ExitOutcome::Rejected) => t.completed_at,
                _ => t.submitted_at,
            })
            .fold(doc.created_at, |a, b| a.max(b));
        let idle = Utc::now()
            .signed_duration_since(last_submission)
            .to_std()
            .is_ok_and(|d| d > stale_after);
        if !idle {
            return None;
        }
    }

    if doc.state == RunState::Prepared && waiting == doc.tasks.len() {
        Some(format!(
            "run {} was prepared but never submitted ({})",
            doc.run_id,
            doc.counts()
        ))
    } else {
        Some(format!(
            "{} task(s) of run {} were never handed to the backend",
            waiting, doc.run_id
        ))
    }
}

pub(crate) async fn write_all_done(layout: &RunLayout, doc: &LedgerDoc) -> Result<()> {
    let stamp = match doc.outcome {
        Some(FinalOutcome::Done) if doc.failure_count == 0 => "SUCCESS",
        _ => "FAILURE",
    };
    write_stamp(&layout.all_done(), stamp).await?;
    tracing::info!("Run {} is FINAL: {} ({})", doc.run_id, doc.outcome.map(|o| o.to_string()).unwrap_or_default(), stamp);
    Ok(())
}

async fn write_stamp(path: &Path, stamp: &str) -> Result<()> {
    fs::write(path, format!("{}\n", stamp)).await?;
    Ok(())
}

/// Per-state counts and the failed tasks
pub fn log_summary(doc: &LedgerDoc) {
    let counts = doc.counts();
    tracing::info!("{} [{}] {}", doc.run_id, doc.state, counts);
    for task in doc.in_state(TaskState::Fail) {
        tracing::info!(
            "  FAILED {} (CPU{:04}): {}",
            task.id,
            task.slot,
            task.reason.as_deref().unwrap_or("no reason recorded")
        );
    }
}
