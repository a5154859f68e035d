//! Merging a finished exploration back onto its base branch.

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::{info, instrument};

use crate::core::types::{Exploration, ExplorationStatus};
use crate::io::git::Git;
use crate::io::store::ExplorationStore;

/// Result of a successful `apply`.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub exploration: Exploration,
    /// Commit the base branch points at after the merge.
    pub merge_commit: String,
}

/// Merge the exploration's branch onto the branch it started from.
///
/// Only `Succeeded` explorations are eligible. Merge conflicts abort the
/// merge and surface as [`crate::io::git::MergeConflictError`]; nothing is
/// ever auto-resolved.
#[instrument(skip_all, fields(id))]
pub fn apply_exploration(root: &Path, record_dir: &str, id: &str) -> Result<ApplyOutcome> {
    let store = ExplorationStore::new(root.join(record_dir));
    let exploration = store.get(id)?;

    if exploration.status != ExplorationStatus::Succeeded {
        return Err(anyhow!(
            "exploration '{}' is {}; only succeeded explorations can be applied",
            exploration.id,
            exploration.status.as_str()
        ));
    }

    let git = Git::new(root);
    git.ensure_clean_except_prefixes(&[".explorer/"])?;
    let merge_commit = git.merge_branch(&exploration.branch, &exploration.base_branch)?;
    info!(
        id = %exploration.id,
        branch = %exploration.branch,
        onto = %exploration.base_branch,
        commit = %merge_commit,
        "exploration applied"
    );

    Ok(ApplyOutcome {
        exploration,
        merge_commit,
    })
}
