use std::path::Path;

use serde_yaml::Value;

use super::{program, PlannedTask, TaskPlanner};
use crate::config::{value_as_string, RunConfig, FAST_FACTOR};
use crate::error::{Result, SubmitError};
use crate::scripts::shell_word;

/// One task per `GENVERSION_LIST` entry
pub struct SimPlanner;

impl TaskPlanner for SimPlanner {
    fn plan(&self, config: &RunConfig, _script_dir: &Path) -> Result<Vec<PlannedTask>> {
        let entries = match config.config.get(crate::config::SIM_KEY) {
            Some(Value::Sequence(entries)) => entries,
            _ => {
                return Err(SubmitError::Plan(
                    "GENVERSION_LIST must be a list of GENVERSION entries".to_string(),
                ))
            }
        };

        let program = program(config);
        let default_infile = config.get_str("SIMGEN_INFILE");
        let global_opts = config.get_list("GENOPT_GLOBAL");

        let mut tasks = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let version = entry
                .get("GENVERSION")
                .and_then(value_as_string)
                .ok_or_else(|| SubmitError::Plan(format!("GENVERSION_LIST entry {} has no GENVERSION", i)))?;

            let infile = entry
                .get("SIMGEN_INFILE")
                .and_then(value_as_string)
                .or_else(|| default_infile.clone())
                .ok_or_else(|| {
                    SubmitError::Plan(format!("no SIMGEN_INFILE for GENVERSION {}", version))
                })?;

            let mut command = format!("{} {} GENVERSION {}", program, shell_word(&infile), version);
            for opt in entry_opts(entry).iter().chain(global_opts.iter()) {
                command.push(' ');
                command.push_str(opt);
            }
            if config.options.fast {
                command.push_str(&format!(" NGEN_SCALE {}", 1.0 / f64::from(FAST_FACTOR)));
            }

            tasks.push(PlannedTask { id: version, command });
        }
        Ok(tasks)
    }
}

fn entry_opts(entry: &Value) -> Vec<String> {
    match entry.get("GENOPT") {
        Some(Value::Sequence(items)) => items.iter().filter_map(value_as_string).collect(),
        Some(v) => value_as_string(v).into_iter().collect(),
        None => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::test_support::run_config;

    const INPUT: &str = "\
GENVERSION_LIST:
  - GENVERSION: SIM_A
    GENOPT: GENRANGE_REDSHIFT 0.1 0.5
  - GENVERSION: SIM_B
    SIMGEN_INFILE: other.input
CONFIG:
  SIMGEN_INFILE: sim.input
  GENOPT_GLOBAL: RANSEED 123
";

    #[test]
    fn test_one_task_per_genversion() {
        let cfg = run_config(INPUT, false);
        let tasks = SimPlanner.plan(&cfg, Path::new("/out/SIMLOGS")).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "SIM_A");
        assert_eq!(
            tasks[0].command,
            "snlc_sim.exe sim.input GENVERSION SIM_A GENRANGE_REDSHIFT 0.1 0.5 RANSEED 123"
        );
        assert!(tasks[1].command.starts_with("snlc_sim.exe other.input GENVERSION SIM_B"));
    }

    #[test]
    fn test_fast_mode_scales_generation() {
        let cfg = run_config(INPUT, true);
        let tasks = SimPlanner.plan(&cfg, Path::new("/out/SIMLOGS")).unwrap();
        assert!(tasks.iter().all(|t| t.command.ends_with("NGEN_SCALE 0.1")));
    }

    #[test]
    fn test_missing_infile() {
        let cfg = run_config("GENVERSION_LIST:\n  - GENVERSION: X\n", false);
        assert!(matches!(
            SimPlanner.plan(&cfg, Path::new("/o")),
            Err(SubmitError::Plan(_))
        ));
    }
}
