//! Shared deterministic types for explorer core logic.
//!
//! These types define stable contracts between core components and the shape
//! of persisted exploration records. They should not depend on external state
//! or I/O and must serialize identically across runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Lifecycle status of an exploration.
///
/// `Running` is the only non-terminal state. Terminal states are final: no
/// transition ever leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplorationStatus {
    Running,
    Succeeded,
    Exhausted,
    Aborted,
}

impl ExplorationStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Exhausted => "exhausted",
            Self::Aborted => "aborted",
        }
    }
}

/// Structured outcome of one test-suite run.
///
/// Test ids use pytest's `file::name` addressing. Maps and sets are ordered so
/// serialized records stay stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunReport {
    pub passed: BTreeSet<String>,
    /// Failing test id -> failure message.
    pub failed: BTreeMap<String, String>,
}

impl TestRunReport {
    pub fn all_passed(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Proposed file contents returned by the model for one attempt.
///
/// Each entry is a full overwrite of the named file, relative to the project
/// root. Partial diffs are never applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCandidate {
    /// Relative path -> complete new file content.
    pub files: BTreeMap<String, String>,
    /// Optional one-line description from the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// One loop iteration: a test run plus the (possibly retried) patch that
/// answered it. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// Iteration index, 1-indexed, equal to the exploration's count at the
    /// time the attempt was recorded.
    pub iter: u32,
    pub tests: TestRunReport,
    pub patch: PatchCandidate,
    /// Commit sha produced by applying the patch.
    pub commit: String,
    /// Unix epoch seconds.
    pub recorded_at: u64,
}

/// One bounded attempt to satisfy a test suite via iterative AI patches on an
/// isolated branch. This is the durable record shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exploration {
    pub id: String,
    /// The isolated branch the exploration commits to (`explore/<id>`).
    pub branch: String,
    /// Branch the exploration started from; `apply` merges back onto it.
    pub base_branch: String,
    /// Test ids in scope; empty means the whole suite.
    pub tests: Vec<String>,
    pub status: ExplorationStatus,
    /// Number of recorded attempts. Never exceeds `max_iterations`.
    pub iterations: u32,
    pub max_iterations: u32,
    pub attempts: Vec<Attempt>,
    /// Unix epoch seconds.
    pub created_at: u64,
    /// Reason recorded when the exploration aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Exploration {
    pub fn new(
        id: String,
        branch: String,
        base_branch: String,
        tests: Vec<String>,
        max_iterations: u32,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            branch,
            base_branch,
            tests,
            status: ExplorationStatus::Running,
            iterations: 0,
            max_iterations,
            attempts: Vec::new(),
            created_at,
            error: None,
        }
    }
}
