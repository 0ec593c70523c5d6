//! Removal of stale generated artifacts under the launch directory

use std::path::{Path, PathBuf};

use glob::Pattern;
use walkdir::WalkDir;

/// Names of generated entries that are safe to delete
pub const PURGE_PATTERNS: &[&str] = &[
    "SPLIT_JOBS_LCFIT*",
    "SCRIPTS_BBCFIT*",
    "FITOPT*.LCPLOT*",
    "FITOPT*.HBOOK*",
    "FITOPT*.ROOT*",
];

#[derive(Debug, Default)]
pub struct PurgeReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

fn patterns() -> Vec<Pattern> {
    PURGE_PATTERNS
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!("Skipping purge pattern {}: {}", p, e);
                None
            }
        })
        .collect()
}

/// Delete every matching entry below `root`; failures are logged, not returned
pub fn purge(root: &Path) -> PurgeReport {
    let patterns = patterns();
    let mut report = PurgeReport::default();

    let mut walker = WalkDir::new(root).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Purge could not read an entry: {}", e);
                continue;
            }
        };

        let name = entry.file_name().to_string_lossy();
        if !patterns.iter().any(|p| p.matches(&name)) {
            continue;
        }

        let path = entry.path().to_path_buf();
        let is_dir = entry.file_type().is_dir();
        if is_dir {
            // whole tree goes, no need to look inside
            walker.skip_current_dir();
        }

        let result = if is_dir {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                tracing::info!("Purged {:?}", path);
                report.removed.push(path);
            }
            Err(e) => {
                tracing::warn!("Could not purge {:?}: {}", path, e);
                report.failed.push(path);
            }
        }
    }

    report
}
