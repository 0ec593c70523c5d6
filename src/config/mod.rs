//! Run configuration
//!
//! A [`RunConfig`] is built once per process from the input file and the
//! command line, then passed by reference to every component. Nothing in the
//! crate reads configuration from globals or the environment after that.

mod classify;
mod legacy;

pub use classify::{classify, Classification, PipelineVariant, SIM_KEY};
pub use legacy::{check_input, translate, Translation, OBSOLETE_CONFIG_KEYS};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Result, SubmitError};
use crate::snapshot::RunSnapshot;

/// Marker line separating the YAML block from trailing program input
pub const END_YAML_MARKER: &str = "#END_YAML";

/// Key of the top-level configuration block
pub const CONFIG_BLOCK: &str = "CONFIG";

/// Which merge entry point this process was started for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Normal submit (or kill / dry run)
    #[default]
    None,
    /// One merge pass, triggered by a finished task
    Single,
    /// Repeat merge passes until the run is final
    Full,
    /// Recreate the ledger, then merge
    Reset,
}

impl MergeMode {
    pub fn is_merge(&self) -> bool {
        !matches!(self, MergeMode::None)
    }
}

/// Flags taken from the command line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Prepare the output area but do not submit
    pub nosubmit: bool,
    /// Scale every task down by [`FAST_FACTOR`]
    pub fast: bool,
    /// Submit without merge triggers in the scripts
    pub nomerge: bool,
    /// Replace an existing output directory
    pub overwrite: bool,
    pub kill: bool,
    #[serde(default)]
    pub merge: MergeMode,
    /// Run token passed by a re-invoked merge process
    #[serde(skip)]
    pub run_token: Option<i64>,
    /// Worker slot passed by a re-invoked merge process
    #[serde(skip)]
    pub cpunum: Option<u32>,
}

/// Reduction factor applied by planners in fast mode
pub const FAST_FACTOR: u32 = 10;

/// Merge and locking tunables
///
/// Read from the `CONFIG` block at prepare time and frozen into the run
/// snapshot, so every later merge process of the run uses the same values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSettings {
    /// A single failed task marks the whole run FAILED
    pub fail_fast: bool,

    /// Maximum time a merge pass waits for the busy token before abandoning
    pub lock_wait_secs: u64,

    /// Age after which a busy token is presumed abandoned
    pub lock_stale_secs: u64,

    /// Interval between passes in full-merge mode
    pub recheck_secs: u64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            fail_fast: false,
            lock_wait_secs: 5,
            // generous: a live holder keeps the token for well under a second
            lock_stale_secs: 600,
            recheck_secs: 60,
        }
    }
}

impl MergeSettings {
    /// Read overrides from a `CONFIG` block, falling back to defaults
    pub fn from_config(block: Option<&Mapping>) -> Result<Self> {
        let mut settings = Self::default();
        let Some(block) = block else {
            return Ok(settings);
        };

        if let Some(v) = block.get("FAIL_FAST") {
            settings.fail_fast = value_as_bool(v).ok_or_else(|| {
                SubmitError::InvalidConfig(format!("FAIL_FAST must be a boolean, got {:?}", v))
            })?;
        }
        for (key, slot) in [
            ("MERGE_LOCK_WAIT_SEC", &mut settings.lock_wait_secs),
            ("MERGE_LOCK_STALE_SEC", &mut settings.lock_stale_secs),
            ("MERGE_RECHECK_SEC", &mut settings.recheck_secs),
        ] {
            if let Some(v) = block.get(key) {
                *slot = value_as_u64(v).ok_or_else(|| {
                    SubmitError::InvalidConfig(format!("{} must be a positive integer, got {:?}", key, v))
                })?;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.lock_stale_secs == 0 {
            return Err(SubmitError::InvalidConfig(
                "MERGE_LOCK_STALE_SEC must be greater than 0".to_string(),
            ));
        }
        if self.lock_wait_secs >= self.lock_stale_secs {
            return Err(SubmitError::InvalidConfig(format!(
                "MERGE_LOCK_WAIT_SEC ({}) must be smaller than MERGE_LOCK_STALE_SEC ({})",
                self.lock_wait_secs, self.lock_stale_secs
            )));
        }
        if self.recheck_secs == 0 {
            return Err(SubmitError::InvalidConfig(
                "MERGE_RECHECK_SEC must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_secs)
    }
}

/// Process-level facts captured once in `main`
#[derive(Debug, Clone)]
pub struct LaunchEnv {
    /// Directory the driver was launched from; relative paths resolve here
    pub launch_dir: PathBuf,
    /// Shared reference-data root (`SNDATA_ROOT`)
    pub data_root: Option<PathBuf>,
    /// Executable that generated scripts re-invoke for merging
    pub exe: PathBuf,
}

/// Fully resolved, immutable configuration of one run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_file: PathBuf,
    /// Canonical input text (translated if the file was legacy)
    pub input_text: String,
    /// Parsed YAML portion of the input
    pub config: Value,
    pub variant: PipelineVariant,
    /// Input was translated from a legacy format
    pub legacy: bool,
    pub options: RunOptions,
    pub settings: MergeSettings,
    pub env: LaunchEnv,
}

impl RunConfig {
    /// Read, translate, parse and classify an input file
    pub fn load(input_file: impl AsRef<Path>, options: RunOptions, env: LaunchEnv) -> Result<Self> {
        let input_file = absolutize(&env.launch_dir, input_file.as_ref());
        let raw = std::fs::read_to_string(&input_file)?;
        Self::from_text(input_file, raw, options, env)
    }

    /// Same as [`RunConfig::load`] for input text already in memory
    pub fn from_text(
        input_file: PathBuf,
        raw: String,
        options: RunOptions,
        env: LaunchEnv,
    ) -> Result<Self> {
        let quiet = options.merge.is_merge();
        let (input_text, legacy_variant) = match check_input(&input_file, &raw)? {
            Translation::Canonical => (raw, None),
            Translation::Legacy { variant, text } => {
                if !quiet {
                    tracing::info!("Translated legacy {} input {:?}", variant, input_file);
                }
                (text, Some(variant))
            }
        };

        let config = parse_yaml(&input_text)?;

        let variant = match legacy_variant {
            Some(variant) => variant,
            None => classify(&config, &input_text, &input_file, quiet)?.variant,
        };

        let settings = MergeSettings::from_config(config_block(&config))?;

        Ok(Self {
            input_file,
            input_text,
            config,
            variant,
            legacy: legacy_variant.is_some(),
            options,
            settings,
            env,
        })
    }

    /// Configuration frozen at prepare time; the input file is not read.
    ///
    /// Relative paths keep resolving against the original launch directory.
    pub fn from_snapshot(snapshot: &RunSnapshot, options: RunOptions, env: LaunchEnv) -> Self {
        Self {
            input_file: snapshot.input_file.clone(),
            input_text: snapshot.input_text.clone(),
            config: snapshot.config.clone(),
            variant: snapshot.variant,
            legacy: snapshot.legacy,
            options,
            settings: snapshot.settings.clone(),
            env: LaunchEnv {
                launch_dir: snapshot.launch_dir.clone(),
                ..env
            },
        }
    }

    /// The `CONFIG` block, if any
    pub fn block(&self) -> Option<&Mapping> {
        config_block(&self.config)
    }

    /// Look up a key in the `CONFIG` block
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.block().and_then(|b| b.get(key))
    }

    /// Look up a scalar in the `CONFIG` block as a string
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(value_as_string)
    }

    /// Look up a key as a list of strings; a scalar becomes a one-element list
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Sequence(items)) => items.iter().filter_map(value_as_string).collect(),
            Some(v) => value_as_string(v).into_iter().collect(),
            None => vec![],
        }
    }

    /// Resolved output directory of the run
    pub fn output_dir(&self) -> Result<PathBuf> {
        if let Some(outdir) = self.get_str("OUTDIR") {
            return Ok(absolutize(&self.env.launch_dir, Path::new(&outdir)));
        }

        match self.variant {
            PipelineVariant::Simulation => {
                let stem = self
                    .input_file
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "SIM".to_string());
                Ok(self.env.launch_dir.join(format!("SIMLOGS_{}", stem)))
            }
            PipelineVariant::Fit | PipelineVariant::BiasCorrection => Err(SubmitError::InvalidConfig(
                format!("CONFIG.OUTDIR is required for {} input {:?}", self.variant, self.input_file),
            )),
        }
    }
}

/// Return the YAML portion of an input file
pub fn extract_yaml(text: &str) -> &str {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with(END_YAML_MARKER) {
            return &text[..offset];
        }
        offset += line.len();
    }
    text
}

/// Parse the YAML portion of an input file; an empty file is an empty mapping
pub fn parse_yaml(text: &str) -> Result<Value> {
    let yaml = extract_yaml(text);
    if yaml.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    Ok(serde_yaml::from_str(yaml)?)
}

pub(crate) fn config_block(config: &Value) -> Option<&Mapping> {
    config.get(CONFIG_BLOCK).and_then(Value::as_mapping)
}

pub(crate) fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        _ => None,
    }
}

fn value_as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
