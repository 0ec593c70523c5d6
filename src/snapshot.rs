//! Run snapshot
//!
//! `SUBMIT.INFO` freezes everything later merge, kill and reset invocations
//! need to know about a run. It is written once at prepare time and never
//! modified.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::backend::BackendSpec;
use crate::config::{absolutize, LaunchEnv, MergeSettings, PipelineVariant, RunConfig, RunOptions};
use crate::error::{Result, SubmitError};
use crate::ledger::LedgerTask;

pub const SNAPSHOT_FILE: &str = "SUBMIT.INFO";

/// Planned task as recorded in the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTask {
    pub id: String,
    pub slot: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    /// Unix seconds at prepare time; carried by every merge trigger
    pub run_token: i64,
    pub variant: PipelineVariant,
    pub input_file: PathBuf,
    /// Input was translated from a legacy format
    #[serde(default)]
    pub legacy: bool,
    pub input_text: String,
    /// Directory the driver ran in
    pub launch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub config: Value,
    pub options: RunOptions,
    pub settings: MergeSettings,
    pub backend: BackendSpec,
    pub n_slots: u32,
    pub tasks: Vec<SnapshotTask>,
    pub created_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn path(output_dir: &Path) -> PathBuf {
        output_dir.join(SNAPSHOT_FILE)
    }

    /// Write the snapshot; fails if one already exists
    pub async fn write(&self, output_dir: &Path) -> Result<()> {
        let path = Self::path(output_dir);
        let content = serde_yaml::to_string(self)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;

        tracing::debug!("Wrote run snapshot {:?}", path);
        Ok(())
    }

    pub async fn load(output_dir: &Path) -> Result<Self> {
        let path = Self::path(output_dir);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SubmitError::SnapshotMissing { path })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Output directory of the run `target` points at.
    ///
    /// `target` is the output directory itself, its `SUBMIT.INFO`, or an
    /// input file whose current `OUTDIR` names the run.
    pub fn locate(target: &Path, env: &LaunchEnv, options: &RunOptions) -> Result<PathBuf> {
        let path = absolutize(&env.launch_dir, target);
        if path.is_dir() {
            return Ok(path);
        }
        if path.file_name().is_some_and(|n| n == SNAPSHOT_FILE) {
            if let Some(dir) = path.parent() {
                return Ok(dir.to_path_buf());
            }
        }
        RunConfig::load(&path, options.clone(), env.clone())?.output_dir()
    }

    /// Ledger rows for the planned tasks, all in WAIT
    pub fn ledger_tasks(&self) -> Vec<LedgerTask> {
        self.tasks
            .iter()
            .map(|t| LedgerTask::new(t.id.clone(), self.variant, t.slot))
            .collect()
    }

    /// Reject merge triggers left over from a superseded run
    pub fn check_token(&self, token: Option<i64>) -> Result<()> {
        match token {
            Some(found) if found != self.run_token => Err(SubmitError::RunTokenMismatch {
                expected: self.run_token,
                found,
            }),
            _ => Ok(()),
        }
    }
}
