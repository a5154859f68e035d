//! The exploration engine: the test / patch / commit loop.
//!
//! One exploration runs on an isolated `explore/<id>` branch. Every recorded
//! attempt and every status transition is persisted immediately, so the
//! on-disk record is accurate even if the process dies mid-loop.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::machine::{NextAction, bounded_history, next_action};
use crate::core::types::{Attempt, Exploration, ExplorationStatus, PatchCandidate};
use crate::io::config::ExplorerConfig;
use crate::io::context::{FailureContext, build_failure_context};
use crate::io::git::Git;
use crate::io::model::PatchGenerationError;
use crate::io::patch::{PatchGenerator, apply_patch};
use crate::io::pytest::TestRunner;
use crate::io::store::{ExplorationNotFoundError, ExplorationStore};

/// Consecutive model-call retries allowed inside one iteration.
const MAX_PATCH_RETRIES: u32 = 3;

/// Another exploration is still running in this working tree.
#[derive(Debug, Clone)]
pub struct ExplorationRunningError {
    pub id: String,
}

impl fmt::Display for ExplorationRunningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exploration '{}' is still running in this working tree",
            self.id
        )
    }
}

impl std::error::Error for ExplorationRunningError {}

/// Per-invocation options from the CLI.
#[derive(Debug, Clone, Default)]
pub struct ExploreOptions {
    /// Test ids in scope; empty means the whole suite.
    pub tests: Vec<String>,
    /// Overrides the configured iteration budget.
    pub max_iterations: Option<u32>,
}

/// Run one exploration to a terminal state.
///
/// Returns the final record. Hard failures inside the loop (test environment
/// broken, patch generation exhausted, interrupt) end the exploration as
/// `Aborted` with the reason persisted; only setup failures before the record
/// exists surface as `Err`.
#[instrument(skip_all, fields(tests = options.tests.len()))]
pub fn run_exploration<T: TestRunner, P: PatchGenerator>(
    root: &Path,
    runner: &T,
    generator: &P,
    config: &ExplorerConfig,
    options: &ExploreOptions,
    cancel: &AtomicBool,
) -> Result<Exploration> {
    let max_iterations = options.max_iterations.unwrap_or(config.max_iterations);
    if max_iterations == 0 {
        return Err(anyhow!("max_iterations must be > 0"));
    }

    let store = ExplorationStore::new(root.join(&config.record_dir));
    if let Some(running) = store.running()? {
        return Err(anyhow!(ExplorationRunningError { id: running.id }));
    }

    let git = Git::new(root);
    git.ensure_clean_except_prefixes(&[".explorer/"])?;
    let base_branch = git.current_branch()?;

    let id = allocate_id(&git, &store)?;
    let branch = format!("explore/{id}");
    git.checkout_new_branch(&branch)?;
    let mut exploration = Exploration::new(
        id,
        branch,
        base_branch.clone(),
        options.tests.clone(),
        max_iterations,
        now_epoch(),
    );
    store.save(&exploration)?;
    info!(id = %exploration.id, branch = %exploration.branch, "exploration started");

    if let Err(err) = drive(
        root,
        runner,
        generator,
        config,
        cancel,
        &git,
        &store,
        &mut exploration,
    ) {
        warn!(id = %exploration.id, err = %err, "exploration aborted");
        exploration.status = ExplorationStatus::Aborted;
        exploration.error = Some(format!("{err:#}"));
        store.save(&exploration)?;
    }

    // Leave the user's tree where the exploration found it. The branch keeps
    // the commits either way.
    if let Err(err) = git.checkout_branch(&base_branch) {
        warn!(err = %err, "could not return to base branch");
    }
    Ok(exploration)
}

#[allow(clippy::too_many_arguments)]
fn drive<T: TestRunner, P: PatchGenerator>(
    root: &Path,
    runner: &T,
    generator: &P,
    config: &ExplorerConfig,
    cancel: &AtomicBool,
    git: &Git,
    store: &ExplorationStore,
    exploration: &mut Exploration,
) -> Result<()> {
    loop {
        check_cancel(cancel)?;
        let report = runner.run(&exploration.tests)?;

        match next_action(&report, exploration.iterations, exploration.max_iterations) {
            NextAction::Succeed => {
                info!(id = %exploration.id, iterations = exploration.iterations, "suite passed");
                exploration.status = ExplorationStatus::Succeeded;
                store.save(exploration)?;
                return Ok(());
            }
            NextAction::Exhaust => {
                info!(id = %exploration.id, max = exploration.max_iterations, "budget spent");
                exploration.status = ExplorationStatus::Exhausted;
                store.save(exploration)?;
                return Ok(());
            }
            NextAction::Propose => {}
        }

        check_cancel(cancel)?;
        let history = bounded_history(&exploration.attempts, config.search_depth as usize);
        let ctx = build_failure_context(root, &report, history)?;
        let candidate = propose_with_retries(generator, &ctx)?;

        apply_patch(root, &candidate)?;
        let iter = exploration.iterations + 1;
        let commit = git
            .commit_all(&format!("{}: iteration {iter}", exploration.id))
            .context("commit patched files")?;
        debug!(iter, commit = %commit, "attempt committed");

        exploration.iterations = iter;
        exploration.attempts.push(Attempt {
            iter,
            tests: report,
            patch: candidate,
            commit,
            recorded_at: now_epoch(),
        });
        store.save(exploration)?;
    }
}

/// Call the generator, retrying only on [`PatchGenerationError`].
///
/// Anything else (context assembly bugs, unexpected I/O) is not retryable and
/// aborts the exploration.
fn propose_with_retries<P: PatchGenerator>(
    generator: &P,
    ctx: &FailureContext,
) -> Result<PatchCandidate> {
    let mut last_reason = String::new();
    for attempt in 1..=MAX_PATCH_RETRIES {
        match generator.propose(ctx) {
            Ok(candidate) => return Ok(candidate),
            Err(err) => match err.downcast_ref::<PatchGenerationError>() {
                Some(generation) => {
                    warn!(attempt, reason = %generation.reason, "patch generation retry");
                    last_reason = generation.reason.clone();
                }
                None => return Err(err),
            },
        }
    }
    Err(anyhow!(
        "patch generation failed after {MAX_PATCH_RETRIES} attempts: {last_reason}"
    ))
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(anyhow!("interrupted by user"));
    }
    Ok(())
}

/// `explore-<sha8>`, suffixed with a counter when the id is already taken by
/// an earlier exploration from the same HEAD.
fn allocate_id(git: &Git, store: &ExplorationStore) -> Result<String> {
    let sha = git.head_short_sha(8)?;
    for n in 1u32.. {
        let id = if n == 1 {
            format!("explore-{sha}")
        } else {
            format!("explore-{sha}-{n}")
        };
        if git.branch_exists(&format!("explore/{id}"))? {
            continue;
        }
        match store.get(&id) {
            Ok(_) => continue,
            Err(err) if err.downcast_ref::<ExplorationNotFoundError>().is_some() => {
                return Ok(id);
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("id allocation counter overflowed")
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedPatchGenerator, ScriptedTestRunner, TestRepo, failing_report, fixing_candidate,
        passing_report,
    };

    fn test_config() -> ExplorerConfig {
        ExplorerConfig {
            max_iterations: 3,
            ..ExplorerConfig::default()
        }
    }

    fn generation_error(reason: &str) -> anyhow::Error {
        anyhow!(PatchGenerationError::new(reason))
    }

    #[test]
    fn succeeds_without_attempts_when_suite_already_passes() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");
        let runner = ScriptedTestRunner::new(vec![Ok(passing_report())]);
        let generator = ScriptedPatchGenerator::new(vec![]);
        let cancel = AtomicBool::new(false);

        let exploration = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &test_config(),
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("run");

        assert_eq!(exploration.status, ExplorationStatus::Succeeded);
        assert_eq!(exploration.iterations, 0);
        assert!(exploration.attempts.is_empty());

        let git = Git::new(repo.root());
        assert_eq!(
            git.current_branch().expect("branch"),
            exploration.base_branch
        );
        assert!(git.branch_exists(&exploration.branch).expect("exists"));
    }

    #[test]
    fn patches_commit_and_succeed() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");
        let runner = ScriptedTestRunner::new(vec![Ok(failing_report()), Ok(passing_report())]);
        let generator = ScriptedPatchGenerator::new(vec![Ok(fixing_candidate())]);
        let cancel = AtomicBool::new(false);

        let exploration = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &test_config(),
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("run");

        assert_eq!(exploration.status, ExplorationStatus::Succeeded);
        assert_eq!(exploration.iterations, 1);
        assert_eq!(exploration.attempts.len(), 1);
        assert_eq!(exploration.attempts[0].iter, 1);
        assert_eq!(exploration.attempts[0].commit.len(), 40);

        // The record on disk matches what was returned.
        let store =
            ExplorationStore::new(repo.root().join(&test_config().record_dir));
        let persisted = store.get(&exploration.id).expect("get");
        assert_eq!(persisted, exploration);
    }

    #[test]
    fn exhausts_budget_with_exactly_max_attempts() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");

        let mut second = PatchCandidate::default();
        second.files.insert(
            "src/calculator.py".to_string(),
            "def add(a, b):\n    return 5\n".to_string(),
        );
        let runner = ScriptedTestRunner::new(vec![
            Ok(failing_report()),
            Ok(failing_report()),
            Ok(failing_report()),
        ]);
        let generator = ScriptedPatchGenerator::new(vec![Ok(fixing_candidate()), Ok(second)]);
        let cancel = AtomicBool::new(false);

        let config = ExplorerConfig {
            max_iterations: 2,
            ..ExplorerConfig::default()
        };
        let exploration = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &config,
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("run");

        assert_eq!(exploration.status, ExplorationStatus::Exhausted);
        assert_eq!(exploration.iterations, 2);
        assert_eq!(exploration.attempts.len(), 2);
    }

    #[test]
    fn generation_errors_are_retried_within_one_iteration() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");
        let runner = ScriptedTestRunner::new(vec![Ok(failing_report()), Ok(passing_report())]);
        let generator = ScriptedPatchGenerator::new(vec![
            Err(generation_error("rate limited")),
            Err(generation_error("bad json")),
            Ok(fixing_candidate()),
        ]);
        let cancel = AtomicBool::new(false);

        let exploration = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &test_config(),
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("run");

        assert_eq!(exploration.status, ExplorationStatus::Succeeded);
        assert_eq!(exploration.attempts.len(), 1);
    }

    #[test]
    fn repeated_generation_failure_aborts_with_reason() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");
        let runner = ScriptedTestRunner::new(vec![Ok(failing_report())]);
        let generator = ScriptedPatchGenerator::new(vec![
            Err(generation_error("rate limited")),
            Err(generation_error("rate limited")),
            Err(generation_error("rate limited")),
        ]);
        let cancel = AtomicBool::new(false);

        let exploration = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &test_config(),
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("run");

        assert_eq!(exploration.status, ExplorationStatus::Aborted);
        let reason = exploration.error.expect("reason");
        assert!(reason.contains("patch generation failed after 3 attempts"));

        // Terminal state is persisted, and the user is back on the base branch.
        let store =
            ExplorationStore::new(repo.root().join(&test_config().record_dir));
        let persisted = store.get(&exploration.id).expect("get");
        assert_eq!(persisted.status, ExplorationStatus::Aborted);
        let git = Git::new(repo.root());
        assert_eq!(
            git.current_branch().expect("branch"),
            exploration.base_branch
        );
    }

    #[test]
    fn refuses_to_start_while_another_runs() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");

        let config = test_config();
        let store = ExplorationStore::new(repo.root().join(&config.record_dir));
        store
            .save(&Exploration::new(
                "explore-other123".to_string(),
                "explore/explore-other123".to_string(),
                "main".to_string(),
                Vec::new(),
                3,
                100,
            ))
            .expect("save running record");

        let runner = ScriptedTestRunner::new(vec![]);
        let generator = ScriptedPatchGenerator::new(vec![]);
        let cancel = AtomicBool::new(false);

        let err = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &config,
            &ExploreOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(err.downcast_ref::<ExplorationRunningError>().is_some());
    }

    #[test]
    fn dirty_tree_is_refused_before_any_record_exists() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");
        std::fs::write(repo.root().join("scratch.txt"), "wip\n").expect("write");

        let runner = ScriptedTestRunner::new(vec![]);
        let generator = ScriptedPatchGenerator::new(vec![]);
        let cancel = AtomicBool::new(false);

        let config = test_config();
        let err = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &config,
            &ExploreOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not clean"));

        let store = ExplorationStore::new(repo.root().join(&config.record_dir));
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn zero_iteration_override_is_rejected_before_branching() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");
        let runner = ScriptedTestRunner::new(vec![]);
        let generator = ScriptedPatchGenerator::new(vec![]);
        let cancel = AtomicBool::new(false);

        let config = test_config();
        let options = ExploreOptions {
            max_iterations: Some(0),
            ..ExploreOptions::default()
        };
        let err = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &config,
            &options,
            &cancel,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_iterations"));

        let git = Git::new(repo.root());
        assert!(git.list_branches("explore/").expect("list").is_empty());
        let store = ExplorationStore::new(repo.root().join(&config.record_dir));
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn cancellation_persists_aborted() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");
        let runner = ScriptedTestRunner::new(vec![]);
        let generator = ScriptedPatchGenerator::new(vec![]);
        let cancel = AtomicBool::new(true);

        let exploration = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &test_config(),
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("run");

        assert_eq!(exploration.status, ExplorationStatus::Aborted);
        assert!(exploration.error.expect("reason").contains("interrupted"));
    }

    #[test]
    fn second_exploration_from_same_head_gets_suffixed_id() {
        let repo = TestRepo::new().expect("repo");
        repo.write_failing_project().expect("project");
        let cancel = AtomicBool::new(false);
        let config = test_config();

        let first = run_exploration(
            repo.root(),
            &ScriptedTestRunner::new(vec![Ok(passing_report())]),
            &ScriptedPatchGenerator::new(vec![]),
            &config,
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("first run");

        let second = run_exploration(
            repo.root(),
            &ScriptedTestRunner::new(vec![Ok(passing_report())]),
            &ScriptedPatchGenerator::new(vec![]),
            &config,
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("second run");

        assert_ne!(first.id, second.id);
        assert_eq!(second.id, format!("{}-2", first.id));
    }
}
