//! End-to-end exploration lifecycle against real git repositories.
//!
//! The test runner and patch generator are scripted; git, the record store,
//! and patch application are real.

use std::sync::atomic::AtomicBool;

use anyhow::anyhow;

use explorer::apply::apply_exploration;
use explorer::core::types::ExplorationStatus;
use explorer::explore::{ExploreOptions, run_exploration};
use explorer::io::config::ExplorerConfig;
use explorer::io::git::Git;
use explorer::io::model::PatchGenerationError;
use explorer::io::store::ExplorationStore;
use explorer::test_support::{
    ScriptedPatchGenerator, ScriptedTestRunner, TestRepo, failing_report, fixing_candidate,
    passing_report,
};

fn config(max_iterations: u32) -> ExplorerConfig {
    ExplorerConfig {
        max_iterations,
        ..ExplorerConfig::default()
    }
}

#[test]
fn succeeded_exploration_merges_back_onto_base() {
    let repo = TestRepo::new().expect("repo");
    repo.write_failing_project().expect("project");
    let git = Git::new(repo.root());
    let base = git.current_branch().expect("branch");

    let runner = ScriptedTestRunner::new(vec![Ok(failing_report()), Ok(passing_report())]);
    let generator = ScriptedPatchGenerator::new(vec![Ok(fixing_candidate())]);
    let cancel = AtomicBool::new(false);

    let cfg = config(5);
    let exploration = run_exploration(
        repo.root(),
        &runner,
        &generator,
        &cfg,
        &ExploreOptions::default(),
        &cancel,
    )
    .expect("explore");
    assert_eq!(exploration.status, ExplorationStatus::Succeeded);

    // The base branch does not have the fix until apply merges it.
    let before = std::fs::read_to_string(repo.root().join("src/calculator.py")).expect("read");
    assert!(before.contains("return 4"));

    let outcome =
        apply_exploration(repo.root(), &cfg.record_dir, &exploration.id).expect("apply");
    assert_eq!(outcome.merge_commit, git.head_sha().expect("head"));
    assert_eq!(git.current_branch().expect("branch"), base);

    let after = std::fs::read_to_string(repo.root().join("src/calculator.py")).expect("read");
    assert!(after.contains("return a + b"));
}

#[test]
fn exhausted_exploration_cannot_be_applied() {
    let repo = TestRepo::new().expect("repo");
    repo.write_failing_project().expect("project");

    let runner = ScriptedTestRunner::new(vec![Ok(failing_report()), Ok(failing_report())]);
    let generator = ScriptedPatchGenerator::new(vec![Ok(fixing_candidate())]);
    let cancel = AtomicBool::new(false);

    let cfg = config(1);
    let exploration = run_exploration(
        repo.root(),
        &runner,
        &generator,
        &cfg,
        &ExploreOptions::default(),
        &cancel,
    )
    .expect("explore");
    assert_eq!(exploration.status, ExplorationStatus::Exhausted);
    assert_eq!(exploration.attempts.len(), 1);

    let err = apply_exploration(repo.root(), &cfg.record_dir, &exploration.id).unwrap_err();
    assert!(err.to_string().contains("only succeeded"));
}

#[test]
fn aborted_exploration_keeps_branch_and_record_for_inspection() {
    let repo = TestRepo::new().expect("repo");
    repo.write_failing_project().expect("project");

    let runner = ScriptedTestRunner::new(vec![Ok(failing_report())]);
    let generator = ScriptedPatchGenerator::new(vec![
        Err(anyhow!(PatchGenerationError::new("service unavailable"))),
        Err(anyhow!(PatchGenerationError::new("service unavailable"))),
        Err(anyhow!(PatchGenerationError::new("service unavailable"))),
    ]);
    let cancel = AtomicBool::new(false);

    let cfg = config(5);
    let exploration = run_exploration(
        repo.root(),
        &runner,
        &generator,
        &cfg,
        &ExploreOptions::default(),
        &cancel,
    )
    .expect("explore");
    assert_eq!(exploration.status, ExplorationStatus::Aborted);

    let git = Git::new(repo.root());
    assert!(git.branch_exists(&exploration.branch).expect("exists"));
    assert_eq!(git.current_branch().expect("branch"), exploration.base_branch);

    let store = ExplorationStore::new(repo.root().join(&cfg.record_dir));
    let persisted = store.get(&exploration.id).expect("get");
    assert_eq!(persisted.status, ExplorationStatus::Aborted);
    assert!(
        persisted
            .error
            .expect("reason")
            .contains("service unavailable")
    );
}

#[test]
fn sequential_explorations_list_newest_first_with_unique_ids() {
    let repo = TestRepo::new().expect("repo");
    repo.write_failing_project().expect("project");
    let cancel = AtomicBool::new(false);
    let cfg = config(5);

    for _ in 0..2 {
        let runner = ScriptedTestRunner::new(vec![Ok(passing_report())]);
        let generator = ScriptedPatchGenerator::new(vec![]);
        let exploration = run_exploration(
            repo.root(),
            &runner,
            &generator,
            &cfg,
            &ExploreOptions::default(),
            &cancel,
        )
        .expect("explore");
        assert_eq!(exploration.status, ExplorationStatus::Succeeded);
    }

    let store = ExplorationStore::new(repo.root().join(&cfg.record_dir));
    let listed = store.list().expect("list");
    assert_eq!(listed.len(), 2);
    assert_ne!(listed[0].id, listed[1].id);
    assert!(listed[0].created_at >= listed[1].created_at);
}
