//! Task planning
//!
//! Each pipeline variant has its own planner turning the configuration into
//! an ordered list of tasks. Task ids are stable: planning the same input
//! twice yields the same ids in the same order.

mod bbc;
mod fit;
mod sim;

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{PipelineVariant, RunConfig};
use crate::error::{Result, SubmitError};

pub use bbc::BbcPlanner;
pub use fit::FitPlanner;
pub use sim::SimPlanner;

/// One task produced by a planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    /// Shell command line, run from the launch directory
    pub command: String,
}

pub trait TaskPlanner {
    /// Expand the configuration; `script_dir` receives per-task outputs
    fn plan(&self, config: &RunConfig, script_dir: &Path) -> Result<Vec<PlannedTask>>;
}

pub fn planner_for(variant: PipelineVariant) -> Box<dyn TaskPlanner> {
    match variant {
        PipelineVariant::Simulation => Box::new(SimPlanner),
        PipelineVariant::Fit => Box::new(FitPlanner),
        PipelineVariant::BiasCorrection => Box::new(BbcPlanner),
    }
}

/// Plan a run and check the result is usable
pub fn plan_tasks(config: &RunConfig, script_dir: &Path) -> Result<Vec<PlannedTask>> {
    let tasks = planner_for(config.variant).plan(config, script_dir)?;

    if tasks.is_empty() {
        return Err(SubmitError::Plan(format!(
            "{} input {:?} produced no tasks",
            config.variant, config.input_file
        )));
    }

    let mut seen = HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(SubmitError::Plan(format!("duplicate task id '{}'", task.id)));
        }
    }

    tracing::info!("Planned {} {} tasks", tasks.len(), config.variant);
    Ok(tasks)
}

/// Program each task runs: `CONFIG.JOBNAME` or the variant's default
pub(crate) fn program(config: &RunConfig) -> String {
    config
        .get_str("JOBNAME")
        .unwrap_or_else(|| config.variant.default_program().to_string())
}

/// `<key> <value>` option pairs such as `GENZ_MAX 1.2` or `/LABEL/ args`,
/// with an optional leading `/LABEL/` removed
pub(crate) fn strip_label(option: &str) -> &str {
    let option = option.trim();
    if let Some(rest) = option.strip_prefix('/') {
        if let Some((_, args)) = rest.split_once('/') {
            return args.trim();
        }
    }
    option
}
