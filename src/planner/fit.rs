use std::path::Path;

use super::{program, strip_label, PlannedTask, TaskPlanner};
use crate::config::{RunConfig, FAST_FACTOR};
use crate::error::{Result, SubmitError};
use crate::scripts::shell_word;

/// One task per data version and fit option; FITOPT000 is the default fit
pub struct FitPlanner;

impl TaskPlanner for FitPlanner {
    fn plan(&self, config: &RunConfig, script_dir: &Path) -> Result<Vec<PlannedTask>> {
        let versions = config.get_list("VERSION");
        if versions.is_empty() {
            return Err(SubmitError::Plan("CONFIG.VERSION lists no data versions".to_string()));
        }

        let mut fitopts = vec![String::new()];
        fitopts.extend(config.get_list("FITOPT").iter().map(|o| strip_label(o).to_string()));

        let program = program(config);
        let input = shell_word(&config.input_file.to_string_lossy());

        let mut tasks = Vec::with_capacity(versions.len() * fitopts.len());
        for version in &versions {
            for (n, fitopt) in fitopts.iter().enumerate() {
                let id = format!("{}-FITOPT{:03}", version, n);
                let prefix = script_dir.join(&id);

                let mut command = format!(
                    "{} {} VERSION_PHOTOMETRY {} TEXTFILE_PREFIX {}",
                    program,
                    input,
                    version,
                    shell_word(&prefix.to_string_lossy())
                );
                if !fitopt.is_empty() {
                    command.push(' ');
                    command.push_str(fitopt);
                }
                if config.options.fast {
                    command.push_str(&format!(" SIM_PRESCALE {}", FAST_FACTOR));
                }
                tasks.push(PlannedTask { id, command });
            }
        }
        Ok(tasks)
    }
}
