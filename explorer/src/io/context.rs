//! Failure context assembly for patch prompts.
//!
//! Gathers the source files the model needs to see for the current failures:
//! the failing test files, the implementation modules they appear to target,
//! and every file touched by recent attempts. All paths stay relative to the
//! project root.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::types::{Attempt, TestRunReport};

/// Everything the patch generator renders into one prompt.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    pub report: TestRunReport,
    /// Relative path -> current content for every file in scope.
    pub sources: BTreeMap<String, String>,
    /// Recent attempts, oldest first, already bounded by search depth.
    pub history: Vec<Attempt>,
}

/// Collect sources and history for the current failures.
///
/// Missing files are skipped rather than treated as errors: a test may target
/// a module that does not exist yet, and creating it is exactly the patch we
/// want the model to propose.
#[instrument(skip_all, fields(failed = report.failed.len(), history = history.len()))]
pub fn build_failure_context(
    root: &Path,
    report: &TestRunReport,
    history: &[Attempt],
) -> Result<FailureContext> {
    let mut paths: BTreeSet<String> = BTreeSet::new();

    for test_id in report.failed.keys() {
        let Some((file, _)) = test_id.split_once("::") else {
            continue;
        };
        paths.insert(file.to_string());
        if let Some(module) = inferred_module_name(file) {
            if let Some(found) = find_module_file(root, &module)? {
                paths.insert(found);
            }
        }
    }

    for attempt in history {
        for path in attempt.patch.files.keys() {
            paths.insert(path.clone());
        }
    }

    let mut sources = BTreeMap::new();
    for rel in paths {
        let abs = root.join(&rel);
        if !abs.is_file() {
            debug!(path = %rel, "context file does not exist yet, skipping");
            continue;
        }
        let contents =
            fs::read_to_string(&abs).with_context(|| format!("read {}", abs.display()))?;
        sources.insert(rel, contents);
    }

    Ok(FailureContext {
        report: report.clone(),
        sources,
        history: history.to_vec(),
    })
}

/// `tests/test_calculator.py` -> `calculator`.
fn inferred_module_name(test_file: &str) -> Option<String> {
    let stem = Path::new(test_file).file_stem()?.to_str()?;
    let module = stem.strip_prefix("test_")?;
    if module.is_empty() {
        return None;
    }
    Some(module.to_string())
}

/// Search the project tree for `<module>.py`, returning its relative path.
///
/// Hidden directories and caches are skipped; the first match in sorted
/// traversal order wins so the result is deterministic.
fn find_module_file(root: &Path, module: &str) -> Result<Option<String>> {
    let filename = format!("{module}.py");
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(iter) => iter.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(e) => {
                warn!(dir = %dir.display(), err = %e, "skipping unreadable directory");
                continue;
            }
        };
        entries.sort();
        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                if name.starts_with('.') || name == "__pycache__" {
                    continue;
                }
                stack.push(path);
            } else if name == filename {
                let rel = path
                    .strip_prefix(root)
                    .with_context(|| format!("relativize {}", path.display()))?;
                return Ok(Some(rel.to_string_lossy().replace('\\', "/")));
            }
        }
    }
    Ok(None)
}
