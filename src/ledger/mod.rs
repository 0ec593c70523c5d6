//! Merge ledger
//!
//! The durable record of every task's state for one run, shared by the
//! driver and every merge process. Reads are lock-free (writes replace the
//! file atomically); every write goes through the run's busy token.

pub mod lock;

pub use lock::{BusyToken, LockPolicy, MergeLock};

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::config::PipelineVariant;
use crate::error::{Result, SubmitError};

/// Ledger file name inside the output directory
pub const LEDGER_FILE: &str = "MERGE.LOG";
/// Busy token file name inside the output directory
pub const BUSY_FILE: &str = "MERGE.BUSY";

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "WAIT")]
    Wait,
    #[serde(rename = "RUN")]
    Run,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "KILLED")]
    Killed,
}

impl TaskState {
    /// Position in the lifecycle; transitions must strictly increase it
    pub fn rank(&self) -> u8 {
        match self {
            TaskState::Wait => 0,
            TaskState::Run => 1,
            TaskState::Done | TaskState::Fail | TaskState::Killed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn can_become(&self, next: TaskState) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Wait => "WAIT",
            TaskState::Run => "RUN",
            TaskState::Done => "DONE",
            TaskState::Fail => "FAIL",
            TaskState::Killed => "KILLED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitOutcome {
    Success,
    Failure,
    Killed,
    /// Backend refused the task at submission
    Rejected,
}

impl ExitOutcome {
    /// Default outcome recorded for a terminal state
    fn for_state(state: TaskState) -> Option<Self> {
        match state {
            TaskState::Done => Some(ExitOutcome::Success),
            TaskState::Fail => Some(ExitOutcome::Failure),
            TaskState::Killed => Some(ExitOutcome::Killed),
            TaskState::Wait | TaskState::Run => None,
        }
    }
}

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// No ledger exists; never written to disk
    Uninitialized,
    Prepared,
    Submitted,
    Merging,
    Final,
}

impl RunState {
    fn rank(&self) -> u8 {
        match self {
            RunState::Uninitialized => 0,
            RunState::Prepared => 1,
            RunState::Submitted => 2,
            RunState::Merging => 3,
            RunState::Final => 4,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Uninitialized => "UNINITIALIZED",
            RunState::Prepared => "PREPARED",
            RunState::Submitted => "SUBMITTED",
            RunState::Merging => "MERGING",
            RunState::Final => "FINAL",
        };
        f.write_str(s)
    }
}

/// Outcome of a run in the FINAL state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalOutcome {
    Done,
    Failed,
    Killed,
}

impl fmt::Display for FinalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalOutcome::Done => "DONE",
            FinalOutcome::Failed => "FAILED",
            FinalOutcome::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// One task row of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTask {
    pub id: String,
    pub variant: PipelineVariant,
    pub state: TaskState,
    /// Worker slot whose script runs this task
    pub slot: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExitOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Backend handle of the slot batch (pid, host:pid or job id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_ref: Option<String>,
}

impl LedgerTask {
    pub fn new(id: impl Into<String>, variant: PipelineVariant, slot: u32) -> Self {
        Self {
            id: id.into(),
            variant,
            state: TaskState::Wait,
            slot,
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
            outcome: None,
            reason: None,
            backend_ref: None,
        }
    }
}

/// Requested move of one task
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub task_id: String,
    pub from: TaskState,
    pub to: TaskState,
    pub outcome: Option<ExitOutcome>,
    pub reason: Option<String>,
    pub backend_ref: Option<String>,
}

impl Transition {
    pub fn new(task_id: impl Into<String>, from: TaskState, to: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            from,
            to,
            outcome: None,
            reason: None,
            backend_ref: None,
        }
    }

    pub fn with_outcome(mut self, outcome: ExitOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_backend_ref(mut self, backend_ref: impl Into<String>) -> Self {
        self.backend_ref = Some(backend_ref.into());
        self
    }
}

/// Per-state task counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub wait: usize,
    pub run: usize,
    pub done: usize,
    pub fail: usize,
    pub killed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.wait + self.run + self.done + self.fail + self.killed
    }

    pub fn terminal(&self) -> usize {
        self.done + self.fail + self.killed
    }
}

impl fmt::Display for StateCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WAIT={} RUN={} DONE={} FAIL={} KILLED={}",
            self.wait, self.run, self.done, self.fail, self.killed
        )
    }
}

/// Run-level metadata written at initialization
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub run_id: String,
    pub variant: PipelineVariant,
    pub output_dir: PathBuf,
}

/// Full ledger contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerDoc {
    pub run_id: String,
    pub variant: PipelineVariant,
    pub output_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<FinalOutcome>,
    #[serde(default)]
    pub failure_count: usize,
    pub tasks: Vec<LedgerTask>,
}

impl LedgerDoc {
    pub fn new(meta: RunMeta, tasks: Vec<LedgerTask>) -> Self {
        let now = Utc::now();
        Self {
            run_id: meta.run_id,
            variant: meta.variant,
            output_dir: meta.output_dir,
            created_at: now,
            updated_at: now,
            state: RunState::Prepared,
            outcome: None,
            failure_count: 0,
            tasks,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&LedgerTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for task in &self.tasks {
            match task.state {
                TaskState::Wait => counts.wait += 1,
                TaskState::Run => counts.run += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Fail => counts.fail += 1,
                TaskState::Killed => counts.killed += 1,
            }
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_terminal())
    }

    pub fn is_final(&self) -> bool {
        self.state == RunState::Final
    }

    /// Tasks in the given state
    pub fn in_state(&self, state: TaskState) -> impl Iterator<Item = &LedgerTask> {
        self.tasks.iter().filter(move |t| t.state == state)
    }

    /// Apply one transition; the document is unchanged on error
    pub fn transition(&mut self, t: &Transition) -> Result<()> {
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.id == t.task_id)
            .ok_or_else(|| SubmitError::UnknownTask(t.task_id.clone()))?;

        if task.state != t.from || !t.from.can_become(t.to) {
            return Err(SubmitError::InvalidTransition {
                task_id: t.task_id.clone(),
                expected: t.from,
                found: task.state,
                requested: t.to,
            });
        }

        let now = Utc::now();
        task.state = t.to;
        if t.to == TaskState::Run {
            task.submitted_at = Some(now);
        }
        if t.to.is_terminal() {
            task.completed_at = Some(now);
            task.outcome = t.outcome.or_else(|| ExitOutcome::for_state(t.to));
        }
        if let Some(reason) = &t.reason {
            task.reason = Some(reason.clone());
        }
        if let Some(backend_ref) = &t.backend_ref {
            task.backend_ref = Some(backend_ref.clone());
        }
        Ok(())
    }

    /// Apply several transitions, all or nothing
    pub fn apply(&mut self, transitions: &[Transition]) -> Result<()> {
        let mut next = self.clone();
        for t in transitions {
            next.transition(t)?;
        }
        *self = next;
        Ok(())
    }

    /// Move the run forward; requests that would move it backwards are ignored
    pub fn advance_run(&mut self, to: RunState) -> bool {
        if to.rank() > self.state.rank() {
            self.state = to;
            true
        } else {
            false
        }
    }

    /// Mark the run FINAL once every task is terminal.
    ///
    /// The outcome depends only on the per-state counts, so it does not
    /// matter in which order the tasks finished.
    pub fn finalize(&mut self, fail_fast: bool) -> Option<FinalOutcome> {
        if self.is_final() {
            return self.outcome;
        }
        if !self.all_terminal() {
            return None;
        }

        let counts = self.counts();
        let outcome = if counts.killed > 0 {
            FinalOutcome::Killed
        } else if counts.fail > 0 && fail_fast {
            FinalOutcome::Failed
        } else {
            FinalOutcome::Done
        };

        self.state = RunState::Final;
        self.outcome = Some(outcome);
        self.failure_count = counts.fail;
        Some(outcome)
    }
}

/// Handle on a run's ledger file
#[derive(Debug, Clone)]
pub struct MergeLedger {
    dir: PathBuf,
    policy: LockPolicy,
    /// Worker slot recorded in busy tokens; `None` for the driver
    worker: Option<u32>,
}

impl MergeLedger {
    pub fn new(dir: impl AsRef<Path>, policy: LockPolicy) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            policy,
            worker: None,
        }
    }

    pub fn with_worker(mut self, worker: Option<u32>) -> Self {
        self.worker = worker;
        self
    }

    /// Same ledger with a different lock wait
    pub fn with_wait(mut self, wait: std::time::Duration) -> Self {
        self.policy.wait = wait;
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    pub fn busy_path(&self) -> PathBuf {
        self.dir.join(BUSY_FILE)
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(self.path()).await.unwrap_or(false)
    }

    /// Create the ledger with every task in WAIT
    pub async fn initialize(&self, meta: RunMeta, tasks: Vec<LedgerTask>) -> Result<LedgerDoc> {
        let _lock = MergeLock::acquire(&self.busy_path(), self.worker, &self.policy).await?;
        if self.exists().await {
            return Err(SubmitError::LedgerExists { path: self.path() });
        }

        let mut doc = LedgerDoc::new(meta, tasks);
        for task in &mut doc.tasks {
            *task = LedgerTask::new(task.id.clone(), task.variant, task.slot);
        }
        self.store(&doc).await?;
        tracing::info!("Created {} with {} tasks in WAIT state", LEDGER_FILE, doc.tasks.len());
        Ok(doc)
    }

    /// Recreate the ledger from scratch, replacing whatever is there
    pub async fn reset(&self, doc: LedgerDoc) -> Result<LedgerDoc> {
        let _lock = MergeLock::acquire(&self.busy_path(), self.worker, &self.policy).await?;
        self.store(&doc).await?;
        tracing::warn!("Reset {} for run {}", LEDGER_FILE, doc.run_id);
        Ok(doc)
    }

    /// Consistent read-only view
    pub async fn snapshot(&self) -> Result<LedgerDoc> {
        let path = self.path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SubmitError::LedgerMissing { path })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Current run state, `Uninitialized` if there is no ledger
    pub async fn run_state(&self) -> Result<RunState> {
        match self.snapshot().await {
            Ok(doc) => Ok(doc.state),
            Err(SubmitError::LedgerMissing { .. }) => Ok(RunState::Uninitialized),
            Err(e) => Err(e),
        }
    }

    pub async fn is_final(&self) -> Result<bool> {
        Ok(self.snapshot().await?.is_final())
    }

    /// Move one task, failing if it is not currently in `from`
    pub async fn transition(&self, task_id: &str, from: TaskState, to: TaskState) -> Result<()> {
        self.apply(&[Transition::new(task_id, from, to)]).await
    }

    /// Apply several transitions under one lock, all or nothing
    pub async fn apply(&self, transitions: &[Transition]) -> Result<()> {
        self.update(|doc| doc.apply(transitions)).await
    }

    /// Locked read-modify-write; nothing is written if `f` fails
    pub async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut LedgerDoc) -> Result<T>,
    {
        let _lock = MergeLock::acquire(&self.busy_path(), self.worker, &self.policy).await?;
        let mut doc = self.snapshot().await?;
        let out = f(&mut doc)?;
        doc.updated_at = Utc::now();
        self.store(&doc).await?;
        Ok(out)
    }

    /// Replace the ledger file atomically
    async fn store(&self, doc: &LedgerDoc) -> Result<()> {
        let content = serde_yaml::to_string(doc)?;
        let tmp = self.dir.join(format!(
            "{}.tmp-{}-{}",
            LEDGER_FILE,
            std::process::id(),
            &Uuid::new_v4().simple().to_string()[..8]
        ));
        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, self.path()).await {
            fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        Ok(())
    }
}
