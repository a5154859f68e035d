//! Stable exit codes for explorer CLI commands.

/// Command succeeded (for `explore`: the suite went green).
pub const OK: i32 = 0;
/// Command failed: bad config, git/vcs failure, unknown id, or other errors.
pub const INVALID: i32 = 1;
/// `explorer explore` ran to the iteration budget without a passing suite.
pub const EXHAUSTED: i32 = 2;
/// `explorer explore` was aborted (interrupt, test environment, or API failure).
pub const ABORTED: i32 = 3;
