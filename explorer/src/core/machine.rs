//! Pure decision logic for the exploration loop.
//!
//! The engine in [`crate::explore`] owns the side effects; this module owns
//! the ordering rules so they can be tested without git, pytest, or a model.

use crate::core::types::{Attempt, TestRunReport};

/// What the loop does next after a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// The failed set is empty: transition to `Succeeded`.
    Succeed,
    /// The budget is spent: transition to `Exhausted`.
    Exhaust,
    /// Ask the patch generator for another candidate.
    Propose,
}

/// Decide the next action for an iteration.
///
/// Order matters: a passing run wins even on the last allowed iteration, and
/// the budget check happens before any further model call so `iterations`
/// never exceeds `max_iterations`.
pub fn next_action(report: &TestRunReport, iterations: u32, max_iterations: u32) -> NextAction {
    if report.all_passed() {
        return NextAction::Succeed;
    }
    if iterations >= max_iterations {
        return NextAction::Exhaust;
    }
    NextAction::Propose
}

/// The most recent `search_depth` attempts, oldest first.
///
/// Bounds how much history flows into prompts.
pub fn bounded_history(attempts: &[Attempt], search_depth: usize) -> &[Attempt] {
    let start = attempts.len().saturating_sub(search_depth);
    &attempts[start..]
}
