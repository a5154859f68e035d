//! Test-driven AI exploration loop runner.
//!
//! This crate implements a bounded explore-until-green loop: run the target
//! project's test suite, hand the failures and surrounding code to a hosted
//! language model, apply the proposed file contents on an isolated git branch,
//! and re-run the tests until they pass or the iteration budget runs out. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (loop decisions, history bounding,
//!   record types). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, pytest, the model
//!   API). Isolated behind traits to enable scripted substitutes in tests.
//!
//! Orchestration modules ([`explore`], [`apply`]) coordinate core logic with
//! I/O to implement CLI commands.

pub mod apply;
pub mod core;
pub mod exit_codes;
pub mod explore;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
