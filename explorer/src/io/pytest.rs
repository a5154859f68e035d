//! Test runner adapter for pytest.
//!
//! The [`TestRunner`] trait decouples the exploration engine from the actual
//! test tool. Tests use scripted runners that return predetermined reports
//! without spawning processes.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::TestRunReport;
use crate::io::process::run_command_with_timeout;

/// The test tool itself could not execute (missing interpreter, bad paths,
/// usage error, timeout). Distinct from tests merely failing assertions.
#[derive(Debug, Clone)]
pub struct TestEnvironmentError {
    pub reason: String,
}

impl fmt::Display for TestEnvironmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test environment failure: {}", self.reason)
    }
}

impl std::error::Error for TestEnvironmentError {}

/// Abstraction over test execution backends.
pub trait TestRunner {
    /// Run the given test ids (empty slice means the whole suite) and return a
    /// structured report. Must not mutate source files.
    fn run(&self, tests: &[String]) -> Result<TestRunReport>;
}

/// Runner that spawns `python -m pytest -v`.
#[derive(Debug, Clone)]
pub struct PytestRunner {
    workdir: PathBuf,
    test_dir: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl PytestRunner {
    pub fn new(
        workdir: impl Into<PathBuf>,
        test_dir: impl Into<String>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            test_dir: test_dir.into(),
            timeout,
            output_limit_bytes,
        }
    }
}

impl TestRunner for PytestRunner {
    #[instrument(skip_all, fields(scoped = !tests.is_empty()))]
    fn run(&self, tests: &[String]) -> Result<TestRunReport> {
        let mut cmd = Command::new("python");
        cmd.args(["-m", "pytest", "-v"]);
        if tests.is_empty() {
            cmd.arg(&self.test_dir);
        } else {
            cmd.args(tests);
        }
        cmd.current_dir(&self.workdir);

        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .map_err(|e| anyhow!(TestEnvironmentError {
                reason: format!("{e:#}"),
            }))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "pytest timed out");
            return Err(anyhow!(TestEnvironmentError {
                reason: format!("pytest timed out after {:?}", self.timeout),
            }));
        }

        // Exit 0 = all passed, 1 = some tests failed; everything else means
        // pytest itself did not run the suite.
        match output.status.code() {
            Some(0) | Some(1) => {}
            Some(5) => {
                return Err(anyhow!(TestEnvironmentError {
                    reason: "pytest collected no tests".to_string(),
                }));
            }
            code => {
                warn!(exit_code = ?code, "pytest could not run");
                return Err(anyhow!(TestEnvironmentError {
                    reason: format!(
                        "pytest exited with {:?}: {}",
                        code,
                        output.stderr_lossy().trim()
                    ),
                }));
            }
        }

        let report = parse_pytest_output(&output.stdout_lossy());
        debug!(
            passed = report.passed.len(),
            failed = report.failed.len(),
            "pytest finished"
        );
        Ok(report)
    }
}

/// Parse `pytest -v` output into a structured report.
///
/// Three kinds of lines carry the signal:
/// - verbose progress lines: `tests/test_x.py::test_y PASSED [ 50%]`
/// - short-summary lines: `FAILED tests/test_x.py::test_y - assert 4 == 5`
/// - `E ` detail lines under the FAILURES section, used when no summary
///   message was seen for a test.
pub fn parse_pytest_output(output: &str) -> TestRunReport {
    let mut report = TestRunReport::default();
    let mut detail_test: Option<String> = None;
    let mut details: Vec<(String, String)> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim_end();

        if let Some(rest) = trimmed.strip_prefix("FAILED ") {
            let (id, message) = match rest.split_once(" - ") {
                Some((id, msg)) => (id.trim(), msg.trim()),
                None => (rest.trim(), ""),
            };
            if id.contains("::") {
                report.failed.insert(id.to_string(), message.to_string());
            }
            continue;
        }

        if trimmed.contains("::") {
            if let Some((id, rest)) = trimmed.split_once(' ') {
                let verdict = rest.trim_start();
                if verdict.starts_with("PASSED") {
                    report.passed.insert(id.to_string());
                    continue;
                }
                if verdict.starts_with("FAILED") {
                    report.failed.entry(id.to_string()).or_default();
                    continue;
                }
            }
        }

        // FAILURES section headers look like `________ test_add ________`.
        if trimmed.starts_with('_') && trimmed.ends_with('_') {
            let name = trimmed.trim_matches(|c: char| c == '_' || c.is_whitespace());
            if !name.is_empty() {
                detail_test = Some(name.to_string());
            }
            continue;
        }

        if let Some(detail) = trimmed.strip_prefix("E ") {
            if let Some(name) = &detail_test {
                details.push((name.clone(), detail.trim_start().to_string()));
            }
        }
    }

    // Fill messages the short summary did not provide.
    for (id, message) in report.failed.iter_mut() {
        if !message.is_empty() {
            continue;
        }
        let name = id.rsplit("::").next().unwrap_or(id);
        let collected: Vec<&str> = details
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, d)| d.as_str())
            .collect();
        if !collected.is_empty() {
            *message = collected.join("\n");
        }
    }

    report
}
