//! Test-only helpers: throwaway git repos and scripted component fakes.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};

use crate::core::types::{PatchCandidate, TestRunReport};
use crate::io::context::FailureContext;
use crate::io::model::{CompletionRequest, ModelClient};
use crate::io::patch::PatchGenerator;
use crate::io::pytest::TestRunner;

/// A temporary git repository with one initial commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "tests@example.com"])?;
        repo.git(&["config", "user.name", "Test Author"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.root().join("README.md"), "# fixture\n").context("write README")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Add a small Python project whose suite fails, and commit it.
    pub fn write_failing_project(&self) -> Result<()> {
        fs::create_dir_all(self.root().join("src")).context("mkdir src")?;
        fs::create_dir_all(self.root().join("tests")).context("mkdir tests")?;
        fs::write(
            self.root().join("src/calculator.py"),
            "def add(a, b):\n    return 4\n",
        )
        .context("write calculator.py")?;
        fs::write(
            self.root().join("tests/test_calculator.py"),
            "from src.calculator import add\n\n\ndef test_add():\n    assert add(2, 3) == 5\n",
        )
        .context("write test_calculator.py")?;
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", "add failing project"])?;
        Ok(())
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Test runner that replays a scripted sequence of reports.
pub struct ScriptedTestRunner {
    script: Mutex<VecDeque<Result<TestRunReport>>>,
}

impl ScriptedTestRunner {
    pub fn new(script: Vec<Result<TestRunReport>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
        }
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, _tests: &[String]) -> Result<TestRunReport> {
        self.script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("test runner script exhausted")))
    }
}

/// Patch generator that replays scripted candidates.
pub struct ScriptedPatchGenerator {
    script: Mutex<VecDeque<Result<PatchCandidate>>>,
}

impl ScriptedPatchGenerator {
    pub fn new(script: Vec<Result<PatchCandidate>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
        }
    }
}

impl PatchGenerator for ScriptedPatchGenerator {
    fn propose(&self, _ctx: &FailureContext) -> Result<PatchCandidate> {
        self.script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("patch generator script exhausted")))
    }
}

/// Model client that replays scripted replies.
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Result<String>>>,
}

impl ScriptedModelClient {
    pub fn new(script: Vec<Result<String>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
        }
    }
}

impl ModelClient for ScriptedModelClient {
    fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        self.script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("model client script exhausted")))
    }
}

/// A report with a single failing test, convenient in loop tests.
pub fn failing_report() -> TestRunReport {
    let mut report = TestRunReport::default();
    report.failed.insert(
        "tests/test_calculator.py::test_add".to_string(),
        "assert 4 == 5".to_string(),
    );
    report
}

/// A report with everything passing.
pub fn passing_report() -> TestRunReport {
    let mut report = TestRunReport::default();
    report
        .passed
        .insert("tests/test_calculator.py::test_add".to_string());
    report
}

/// A candidate that rewrites the fixture calculator so its test passes.
pub fn fixing_candidate() -> PatchCandidate {
    let mut candidate = PatchCandidate::default();
    candidate.files.insert(
        "src/calculator.py".to_string(),
        "def add(a, b):\n    return a + b\n".to_string(),
    );
    candidate.summary = Some("return the sum".to_string());
    candidate
}
