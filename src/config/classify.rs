use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::config_block;
use crate::error::{Result, SubmitError};

/// Pipeline variant that owns a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineVariant {
    #[serde(rename = "SIM")]
    Simulation,
    #[serde(rename = "FIT")]
    Fit,
    #[serde(rename = "BBC")]
    BiasCorrection,
}

impl PipelineVariant {
    pub const ALL: [PipelineVariant; 3] = [
        PipelineVariant::Simulation,
        PipelineVariant::Fit,
        PipelineVariant::BiasCorrection,
    ];

    /// Short tag used in ids and on the command line
    pub fn tag(&self) -> &'static str {
        match self {
            PipelineVariant::Simulation => "SIM",
            PipelineVariant::Fit => "FIT",
            PipelineVariant::BiasCorrection => "BBC",
        }
    }

    /// Inverse of [`PipelineVariant::tag`]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.tag().eq_ignore_ascii_case(tag))
    }

    /// Subdirectory of the output area holding scripts, logs and done markers
    pub fn script_subdir(&self) -> &'static str {
        match self {
            PipelineVariant::Simulation => "SIMLOGS",
            PipelineVariant::Fit => "SPLIT_JOBS_LCFIT",
            PipelineVariant::BiasCorrection => "SCRIPTS_BBCFIT",
        }
    }

    /// Default program run by each task
    pub fn default_program(&self) -> &'static str {
        match self {
            PipelineVariant::Simulation => "snlc_sim.exe",
            PipelineVariant::Fit => "snlc_fit.exe",
            PipelineVariant::BiasCorrection => "SALT2mu.exe",
        }
    }
}

impl fmt::Display for PipelineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineVariant::Simulation => "Simulation",
            PipelineVariant::Fit => "LightCurveFit",
            PipelineVariant::BiasCorrection => "BBC",
        };
        f.write_str(name)
    }
}

/// Key whose presence at top level marks a simulation
pub const SIM_KEY: &str = "GENVERSION_LIST";
/// Key whose presence under `CONFIG` marks a light-curve fit
pub const FIT_KEY: &str = "VERSION";
/// Raw-text token unique to bias-correction input
pub const BBC_TOKEN: &str = "u1=";

/// Variant tag together with the configuration it was derived from
#[derive(Debug, Clone, Copy)]
pub struct Classification<'a> {
    pub variant: PipelineVariant,
    pub config: &'a Value,
}

/// Decide which pipeline variant owns a configuration.
///
/// First match wins: simulation key, then fit key, then the bias-correction
/// token in the raw text. `quiet` suppresses the classification record, which
/// merge processes use to keep their output short.
pub fn classify<'a>(
    config: &'a Value,
    raw_text: &str,
    input_file: &Path,
    quiet: bool,
) -> Result<Classification<'a>> {
    let variant = if config.get(SIM_KEY).is_some() {
        PipelineVariant::Simulation
    } else if config_block(config).is_some_and(|b| b.contains_key(FIT_KEY)) {
        PipelineVariant::Fit
    } else if raw_text.contains(BBC_TOKEN) {
        // no unique batch key for BBC, so fall back to its program input
        PipelineVariant::BiasCorrection
    } else {
        return Err(SubmitError::UnclassifiableConfig {
            path: input_file.to_path_buf(),
        });
    };

    if !quiet {
        tracing::info!("Program class : {}", variant);
    }

    Ok(Classification { variant, config })
}
