//! Output-area layout and submission script generation

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::backend::{BackendSpec, ScriptBatch, MARKER_FAILURE, MARKER_SUCCESS};
use crate::config::{PipelineVariant, RunConfig};
use crate::error::{Result, SubmitError};
use crate::planner::PlannedTask;

/// Written by the driver on reaching FINAL
pub const ALL_DONE_FILE: &str = "ALL.DONE";
/// Present while prepare runs, and left behind if it fails
pub const INCOMPLETE_MARKER: &str = "PREPARE.INCOMPLETE";

/// Placeholders substituted into a scheduler template
const TEMPLATE_NAME: &str = "REPLACE_NAME";
const TEMPLATE_LOGFILE: &str = "REPLACE_LOGFILE";
const TEMPLATE_JOB: &str = "REPLACE_JOB";

/// File names inside one run's output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub output_dir: PathBuf,
    pub script_dir: PathBuf,
}

impl RunLayout {
    pub fn new(output_dir: impl Into<PathBuf>, variant: PipelineVariant) -> Self {
        let output_dir = output_dir.into();
        let script_dir = output_dir.join(variant.script_subdir());
        Self {
            output_dir,
            script_dir,
        }
    }

    pub fn cmd_script(&self, slot: u32) -> PathBuf {
        self.script_dir.join(format!("CPU{:04}_JOBLIST.CMD", slot))
    }

    pub fn batch_script(&self, slot: u32) -> PathBuf {
        self.script_dir.join(format!("CPU{:04}_JOBLIST.BATCH", slot))
    }

    pub fn slot_log(&self, slot: u32) -> PathBuf {
        self.script_dir.join(format!("CPU{:04}_JOBLIST.LOG", slot))
    }

    pub fn task_log(&self, task_id: &str) -> PathBuf {
        self.script_dir.join(format!("{}.LOG", task_id))
    }

    pub fn done_marker(&self, task_id: &str) -> PathBuf {
        self.script_dir.join(format!("{}.DONE", task_id))
    }

    pub fn incomplete_marker(&self) -> PathBuf {
        self.output_dir.join(INCOMPLETE_MARKER)
    }

    pub fn all_done(&self) -> PathBuf {
        self.output_dir.join(ALL_DONE_FILE)
    }
}

/// Quote a word for `sh` unless it is made of safe characters only
pub fn shell_word(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+%@".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Round-robin slot for each task, in task order
pub fn assign_slots(n_tasks: usize, n_slots: u32) -> Vec<u32> {
    let n_slots = n_slots.max(1);
    (0..n_tasks).map(|i| (i as u32) % n_slots).collect()
}

/// Everything a script needs besides the tasks themselves
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    pub config: &'a RunConfig,
    pub layout: &'a RunLayout,
    pub backend: &'a BackendSpec,
    pub run_token: i64,
}

impl ScriptContext<'_> {
    /// Merge invocation addressed to the output directory, so later edits
    /// of the input file cannot redirect it
    fn merge_trigger(&self, flag: &str, slot: u32) -> Option<String> {
        if self.config.options.nomerge {
            return None;
        }
        Some(format!(
            "{} {} {} -t {} --cpunum {}",
            shell_word(&self.config.env.exe.to_string_lossy()),
            shell_word(&self.layout.output_dir.to_string_lossy()),
            flag,
            self.run_token,
            slot
        ))
    }

    /// Shell script running one slot's tasks in order
    pub fn render_cmd(&self, slot: u32, tasks: &[&PlannedTask]) -> String {
        let mut out = String::new();
        out.push_str("#!/usr/bin/env bash\n");
        out.push_str(&format!(
            "# CPU{:04}: {} {} task(s)\n\n",
            slot,
            tasks.len(),
            self.config.variant
        ));
        out.push_str(&format!(
            "cd {}\n",
            shell_word(&self.config.env.launch_dir.to_string_lossy())
        ));
        if let Some(root) = &self.config.env.data_root {
            out.push_str(&format!("export SNDATA_ROOT={}\n", shell_word(&root.to_string_lossy())));
        }

        for task in tasks {
            let log = shell_word(&self.layout.task_log(&task.id).to_string_lossy());
            let done = self.layout.done_marker(&task.id);
            let done_tmp = shell_word(&format!("{}.tmp", done.to_string_lossy()));
            let done = shell_word(&done.to_string_lossy());

            out.push_str(&format!("\n# {}\n", task.id));
            out.push_str(&format!("{} > {} 2>&1\n", task.command, log));
            out.push_str(&format!(
                "if [ $? -eq 0 ]; then echo {} > {}; else echo {} > {}; fi\n",
                MARKER_SUCCESS, done_tmp, MARKER_FAILURE, done_tmp
            ));
            out.push_str(&format!("mv {} {}\n", done_tmp, done));
            if let Some(trigger) = self.merge_trigger("-m", slot) {
                out.push_str(&trigger);
                out.push('\n');
            }
        }

        // the per-task passes may all be abandoned under contention; this
        // one keeps merging until the run is FINAL
        if let Some(trigger) = self.merge_trigger("-M", slot) {
            out.push_str("\n# all tasks of this slot are done\n");
            out.push_str(&trigger);
            out.push('\n');
        }
        out
    }

    /// Scheduler wrapper from the user's template
    pub fn render_batch(&self, template: &str, slot: u32) -> String {
        let name = format!(
            "{}-CPU{:04}",
            self.config.variant.tag(),
            slot
        );
        template
            .replace(TEMPLATE_NAME, &name)
            .replace(TEMPLATE_LOGFILE, &self.layout.slot_log(slot).to_string_lossy())
            .replace(
                TEMPLATE_JOB,
                &format!("sh {}", shell_word(&self.layout.cmd_script(slot).to_string_lossy())),
            )
    }
}

/// Write one script group per slot that has tasks
pub async fn write_scripts(
    ctx: &ScriptContext<'_>,
    tasks: &[PlannedTask],
    slots: &[u32],
) -> Result<Vec<ScriptBatch>> {
    fs::create_dir_all(&ctx.layout.script_dir).await?;

    let template = match ctx.backend {
        BackendSpec::Scheduler { template, .. } => Some(read_template(template).await?),
        _ => None,
    };

    let n_slots = slots.iter().max().map(|m| m + 1).unwrap_or(0);
    let mut batches = Vec::new();

    for slot in 0..n_slots {
        let slot_tasks: Vec<&PlannedTask> = tasks
            .iter()
            .zip(slots)
            .filter(|(_, s)| **s == slot)
            .map(|(t, _)| t)
            .collect();
        if slot_tasks.is_empty() {
            continue;
        }

        let cmd_script = ctx.layout.cmd_script(slot);
        write_executable(&cmd_script, &ctx.render_cmd(slot, &slot_tasks)).await?;

        let batch_script = match &template {
            Some(template) => {
                let path = ctx.layout.batch_script(slot);
                write_executable(&path, &ctx.render_batch(template, slot)).await?;
                Some(path)
            }
            None => None,
        };

        batches.push(ScriptBatch {
            slot,
            cmd_script,
            batch_script,
            log_file: ctx.layout.slot_log(slot),
            work_dir: ctx.config.env.launch_dir.clone(),
            task_ids: slot_tasks.iter().map(|t| t.id.clone()).collect(),
        });
    }

    tracing::info!(
        "Wrote {} CPU*_JOBLIST.CMD scripts in {:?}",
        batches.len(),
        ctx.layout.script_dir
    );
    Ok(batches)
}

async fn read_template(path: &Path) -> Result<String> {
    fs::read_to_string(path).await.map_err(|e| {
        SubmitError::InvalidConfig(format!("cannot read BATCH_INFO template {:?}: {}", path, e))
    })
}

async fn write_executable(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    Ok(())
}
