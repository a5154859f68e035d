//! Test-driven exploration CLI.
//!
//! Runs a project's pytest suite, asks a hosted model for patches when tests
//! fail, and commits each patch on an isolated `explore/<id>` branch until the
//! suite passes or the iteration budget is spent. Finished explorations can be
//! listed and merged back with `apply`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use explorer::apply::apply_exploration;
use explorer::core::types::ExplorationStatus;
use explorer::exit_codes;
use explorer::explore::{ExploreOptions, run_exploration};
use explorer::io::config::load_config;
use explorer::io::git::MergeConflictError;
use explorer::io::init::init_project;
use explorer::io::model::ChatCompletionsClient;
use explorer::io::patch::ModelPatchGenerator;
use explorer::io::pytest::PytestRunner;
use explorer::io::store::ExplorationStore;
use explorer::logging;

#[derive(Parser)]
#[command(
    name = "explorer",
    version,
    about = "Test-driven exploration: pytest failures in, model patches out"
)]
struct Cli {
    /// Project root containing the test suite and `.explorer/` directory.
    project_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.explorer/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one exploration until the suite passes or the budget is spent.
    Explore {
        /// Test ids to satisfy (pytest `file::name` form); default is the whole suite.
        #[arg(short, long)]
        tests: Vec<String>,
        /// Override the configured iteration budget.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Config file path, relative to the project root.
        #[arg(long, default_value = ".explorer/config.toml")]
        config: PathBuf,
    },
    /// List recorded explorations, newest first.
    List,
    /// Merge a succeeded exploration onto its base branch.
    Apply {
        /// Exploration id as shown by `list`.
        id: String,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let root = cli.project_path.as_path();
    match cli.command {
        Command::Init { force } => {
            init_project(root, force)?;
            println!("initialized {}", root.join(".explorer").display());
            Ok(exit_codes::OK)
        }
        Command::Explore {
            tests,
            max_iterations,
            config,
        } => cmd_explore(root, tests, max_iterations, &config),
        Command::List => cmd_list(root),
        Command::Apply { id } => cmd_apply(root, &id),
    }
}

fn cmd_explore(
    root: &Path,
    tests: Vec<String>,
    max_iterations: Option<u32>,
    config_path: &Path,
) -> Result<i32> {
    let config = load_config(&root.join(config_path))?;

    let runner = PytestRunner::new(
        root,
        &config.test_dir,
        Duration::from_secs(config.test_timeout_secs),
        config.output_limit_bytes,
    );
    let client = ChatCompletionsClient::from_config(&config)?;
    let generator = ModelPatchGenerator::new(
        client,
        config.temperature,
        config.modification_strategy,
        config.prompt_budget_bytes,
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("install interrupt handler")?;

    let options = ExploreOptions {
        tests,
        max_iterations,
    };
    let exploration = run_exploration(root, &runner, &generator, &config, &options, &cancel)?;

    match exploration.status {
        ExplorationStatus::Succeeded => {
            println!(
                "exploration {} succeeded after {} iteration(s) on branch {}",
                exploration.id, exploration.iterations, exploration.branch
            );
            println!(
                "merge it with: explorer {} apply {}",
                root.display(),
                exploration.id
            );
            Ok(exit_codes::OK)
        }
        ExplorationStatus::Exhausted => {
            println!(
                "exploration {} exhausted its budget of {} iteration(s); branch {} kept for inspection",
                exploration.id, exploration.max_iterations, exploration.branch
            );
            Ok(exit_codes::EXHAUSTED)
        }
        ExplorationStatus::Aborted => {
            let reason = exploration.error.as_deref().unwrap_or("unknown reason");
            eprintln!("exploration {} aborted: {reason}", exploration.id);
            Ok(exit_codes::ABORTED)
        }
        // The engine only returns terminal records.
        ExplorationStatus::Running => Ok(exit_codes::INVALID),
    }
}

fn cmd_list(root: &Path) -> Result<i32> {
    let config = load_config(&root.join(".explorer/config.toml"))?;
    let store = ExplorationStore::new(root.join(&config.record_dir));
    let explorations = store.list()?;
    if explorations.is_empty() {
        println!("no explorations recorded");
        return Ok(exit_codes::OK);
    }
    for e in explorations {
        println!(
            "{:<28} {:<10} {:>2}/{:<3} started {} branch {}",
            e.id,
            e.status.as_str(),
            e.iterations,
            e.max_iterations,
            e.created_at,
            e.branch
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_apply(root: &Path, id: &str) -> Result<i32> {
    let config = load_config(&root.join(".explorer/config.toml"))?;
    match apply_exploration(root, &config.record_dir, id) {
        Ok(outcome) => {
            println!(
                "merged {} onto {} at {}",
                outcome.exploration.branch, outcome.exploration.base_branch, outcome.merge_commit
            );
            Ok(exit_codes::OK)
        }
        Err(err) => {
            if let Some(conflict) = err.downcast_ref::<MergeConflictError>() {
                eprintln!("{conflict}");
                return Ok(exit_codes::INVALID);
            }
            Err(err)
        }
    }
}
