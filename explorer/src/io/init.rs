//! `.explorer/` workspace scaffolding.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::{ExplorerConfig, write_config};

const GITIGNORE: &str = "explorations/\n*.tmp\n";

/// Initialize the `.explorer/` directory in a project.
///
/// Creates `config.toml` with defaults, the exploration record directory, and
/// a `.gitignore` that keeps records out of version control. Refuses to
/// overwrite an existing config unless `force` is set.
#[instrument(skip_all, fields(force))]
pub fn init_project(root: &Path, force: bool) -> Result<()> {
    let explorer_dir = root.join(".explorer");
    let config_path = explorer_dir.join("config.toml");

    if config_path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        ));
    }

    fs::create_dir_all(explorer_dir.join("explorations"))
        .with_context(|| format!("create {}", explorer_dir.display()))?;

    let config = ExplorerConfig::default();
    write_config(&config_path, &config)?;
    fs::write(explorer_dir.join(".gitignore"), GITIGNORE)
        .with_context(|| format!("write {}", explorer_dir.join(".gitignore").display()))?;

    debug!(dir = %explorer_dir.display(), "initialized explorer workspace");
    Ok(())
}
