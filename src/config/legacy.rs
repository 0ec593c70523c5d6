//! Legacy input detection and translation
//!
//! Old-style inputs are flat `KEY: value` files without a `CONFIG:` block.
//! They are recognised by a fixed, priority-ordered set of discriminants and
//! rewritten in memory into the canonical YAML shape.

use std::path::Path;

use serde_yaml::{Mapping, Value};

use super::classify::{PipelineVariant, BBC_TOKEN};
use super::{CONFIG_BLOCK, END_YAML_MARKER};
use crate::error::{Result, SubmitError};

/// Keys rejected in canonical input, with the remediation shown to the user
pub const OBSOLETE_CONFIG_KEYS: &[(&str, &str)] = &[
    ("DONE_STAMP", "ALL.DONE is always written to OUTDIR; remove this key."),
    ("MERGE_REQUEST", "Merging is automatic; remove this key."),
    ("OUTDIR_COMBINE", "Use OUTDIR."),
    ("CLEANUP_FLAG", "Use the --purge command-line option."),
    ("NODELIST_SSH", "Use NODELIST."),
    ("SNANA_LOGIN_SETUP", "Set up the environment in BATCH_INFO templates instead."),
];

const CANONICAL_MARKER: &str = "CONFIG:";
const SIM_LEGACY_MARKER: &str = "GENVERSION:";
const FIT_LEGACY_MARKER: &str = "VERSION:";

/// Outcome of inspecting an input file
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// File already has a `CONFIG:` block
    Canonical,
    /// File was legacy; `text` is its canonical rewrite
    Legacy {
        variant: PipelineVariant,
        text: String,
    },
}

/// Inspect an input file and translate it if it is in a legacy format.
pub fn check_input(path: &Path, text: &str) -> Result<Translation> {
    let words: Vec<&str> = text.split_whitespace().collect();

    if words.contains(&CANONICAL_MARKER) {
        for word in &words {
            let key = word.trim_end_matches(':');
            if let Some((key, comment)) = OBSOLETE_CONFIG_KEYS.iter().find(|(k, _)| *k == key) {
                return Err(SubmitError::ObsoleteKey {
                    key: key.to_string(),
                    comment: comment.to_string(),
                });
            }
        }
        return Ok(Translation::Canonical);
    }

    let variant = if words.contains(&SIM_LEGACY_MARKER) {
        PipelineVariant::Simulation
    } else if words.contains(&FIT_LEGACY_MARKER) {
        PipelineVariant::Fit
    } else if words.iter().any(|w| w.contains(BBC_TOKEN)) {
        PipelineVariant::BiasCorrection
    } else {
        tracing::debug!("word list of unrecognized input: {:?}", words);
        return Err(SubmitError::UnrecognizedInput {
            path: path.to_path_buf(),
        });
    };

    Ok(Translation::Legacy {
        variant,
        text: translate(variant, text)?,
    })
}

/// Rewrite a legacy input into canonical form for the given variant
pub fn translate(variant: PipelineVariant, text: &str) -> Result<String> {
    let mut block = Mapping::new();
    let mut genversions: Vec<Mapping> = Vec::new();
    let mut program_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = strip_comment(line);
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = split_key_value(line) else {
            if line.contains('=') {
                program_lines.push(line);
            }
            continue;
        };

        match variant {
            PipelineVariant::Simulation if key == "GENVERSION" => {
                let mut entry = Mapping::new();
                entry.insert(Value::from("GENVERSION"), Value::from(value));
                genversions.push(entry);
            }
            // keys after a GENVERSION line belong to that version
            PipelineVariant::Simulation if !genversions.is_empty() => {
                if let Some(entry) = genversions.last_mut() {
                    insert_or_append(entry, key, value);
                }
            }
            _ => insert_or_append(&mut block, key, value),
        }
    }

    let mut root = Mapping::new();
    if variant == PipelineVariant::Simulation {
        root.insert(
            Value::from(super::classify::SIM_KEY),
            Value::Sequence(genversions.into_iter().map(Value::Mapping).collect()),
        );
    }
    root.insert(Value::from(CONFIG_BLOCK), Value::Mapping(block));

    let mut out = serde_yaml::to_string(&Value::Mapping(root))?;
    if variant == PipelineVariant::BiasCorrection {
        out.push_str(END_YAML_MARKER);
        out.push('\n');
        for line in program_lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => line[..idx].trim(),
        None => line.trim(),
    }
}

/// `KEY: value` with a bare upper-case key; `key=value` lines are not split
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(": ").or_else(|| line.strip_suffix(':').map(|k| (k, "")))?;
    let key = key.trim();
    let valid = !key.is_empty()
        && !key.contains(char::is_whitespace)
        && !key.contains('=')
        && key.chars().any(|c| c.is_ascii_uppercase());
    valid.then_some((key, value.trim()))
}

/// Repeated keys become a list, preserving order
fn insert_or_append(map: &mut Mapping, key: &str, value: &str) {
    let k = Value::from(key);
    let v = Value::from(value);
    match map.get_mut(&k) {
        Some(Value::Sequence(items)) => items.push(v),
        Some(existing) => {
            let first = std::mem::replace(existing, Value::Null);
            *existing = Value::Sequence(vec![first, v]);
        }
        None => {
            map.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{classify, parse_yaml};

    fn path() -> &'static Path {
        Path::new("legacy.input")
    }

    #[test]
    fn test_canonical_is_unchanged() {
        let text = "CONFIG:\n  VERSION: v1\n";
        assert_eq!(check_input(path(), text).unwrap(), Translation::Canonical);
    }

    #[test]
    fn test_obsolete_key_rejected() {
        let text = "CONFIG:\n  VERSION: v1\n  DONE_STAMP: ALL.DONE\n";
        match check_input(path(), text) {
            Err(SubmitError::ObsoleteKey { key, comment }) => {
                assert_eq!(key, "DONE_STAMP");
                assert!(!comment.is_empty());
            }
            other => panic!("expected ObsoleteKey, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_legacy() {
        let err = check_input(path(), "JUST: words\nnothing here\n").unwrap_err();
        assert!(matches!(err, SubmitError::UnrecognizedInput { .. }));
    }

    #[test]
    fn test_legacy_sim_translation() {
        let text = "\
NGEN_UNIT: 1  # per season
GENVERSION: MY_SIM_A
GENOPT: GENZ_MAX 1.2
GENVERSION: MY_SIM_B
";
        let Translation::Legacy { variant, text } = check_input(path(), text).unwrap() else {
            panic!("expected legacy translation");
        };
        assert_eq!(variant, PipelineVariant::Simulation);

        let config = parse_yaml(&text).unwrap();
        let list = config["GENVERSION_LIST"].as_sequence().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["GENVERSION"], Value::from("MY_SIM_A"));
        assert_eq!(list[0]["GENOPT"], Value::from("GENZ_MAX 1.2"));
        assert_eq!(config["CONFIG"]["NGEN_UNIT"], Value::from("1"));
    }

    #[test]
    fn test_legacy_fit_collects_repeated_keys() {
        let text = "OUTDIR: FITOUT\nVERSION: V1\nVERSION: V2\n&SNLCINP\n  NFIT_ITERATION = 3\n&END\n";
        let Translation::Legacy { variant, text } = check_input(path(), text).unwrap() else {
            panic!("expected legacy translation");
        };
        assert_eq!(variant, PipelineVariant::Fit);
        let config = parse_yaml(&text).unwrap();
        assert_eq!(config["CONFIG"]["VERSION"].as_sequence().unwrap().len(), 2);
    }

    #[test]
    fn test_legacy_bbc_keeps_program_lines() {
        let text = "OUTDIR: BBCOUT\nu1=1\nu2=1\nprefix=SALT2mu\n";
        let Translation::Legacy { variant, text } = check_input(path(), text).unwrap() else {
            panic!("expected legacy translation");
        };
        assert_eq!(variant, PipelineVariant::BiasCorrection);
        assert!(text.contains("#END_YAML\nu1=1\nu2=1\nprefix=SALT2mu\n"));

        let config = parse_yaml(&text).unwrap();
        assert_eq!(config["CONFIG"]["OUTDIR"], Value::from("BBCOUT"));
    }

    #[test]
    fn test_translation_classifies_like_canonical() {
        let cases = [
            ("GENVERSION: A\n", PipelineVariant::Simulation),
            ("VERSION: V1\nOUTDIR: o\n", PipelineVariant::Fit),
            ("OUTDIR: o\nu1=1\n", PipelineVariant::BiasCorrection),
        ];
        for (legacy, expected) in cases {
            let text = translate(expected, legacy).unwrap();
            let config = parse_yaml(&text).unwrap();
            let got = classify(&config, &text, path(), true).unwrap().variant;
            assert_eq!(got, expected, "legacy input {:?}", legacy);
        }
    }
}
