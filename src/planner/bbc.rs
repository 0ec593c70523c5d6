use std::path::Path;

use super::{program, strip_label, PlannedTask, TaskPlanner};
use crate::config::{RunConfig, FAST_FACTOR};
use crate::error::Result;
use crate::scripts::shell_word;

/// One task per BBC option; MUOPT000 runs the input as written
pub struct BbcPlanner;

impl TaskPlanner for BbcPlanner {
    fn plan(&self, config: &RunConfig, script_dir: &Path) -> Result<Vec<PlannedTask>> {
        let mut muopts = vec![String::new()];
        muopts.extend(config.get_list("MUOPT").iter().map(|o| strip_label(o).to_string()));

        let program = program(config);
        let input = shell_word(&config.input_file.to_string_lossy());
        let inpdirs = config.get_list("INPDIR+");

        let tasks = muopts
            .iter()
            .enumerate()
            .map(|(n, muopt)| {
                let id = format!("BBC-MUOPT{:03}", n);
                let prefix = script_dir.join(&id);

                let mut command = format!(
                    "{} {} prefix={}",
                    program,
                    input,
                    shell_word(&prefix.to_string_lossy())
                );
                if !inpdirs.is_empty() {
                    command.push_str(&format!(" datafile={}", shell_word(&inpdirs.join(","))));
                }
                if !muopt.is_empty() {
                    command.push(' ');
                    command.push_str(muopt);
                }
                if config.options.fast {
                    command.push_str(&format!(" prescale_simdata={}", FAST_FACTOR));
                }
                PlannedTask { id, command }
            })
            .collect();
        Ok(tasks)
    }
}
