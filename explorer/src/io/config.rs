//! Explorer configuration stored under `.explorer/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Hosted model provider for patch generation.
///
/// `deepseek` speaks the OpenAI-compatible chat-completions protocol at its
/// own endpoint; `other` requires an explicit `base_url`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Deepseek,
    Other,
}

/// How the model is asked to shape its patches.
///
/// Application is always a full overwrite of each named file; the strategy
/// only changes the prompt instruction (touch as little as possible vs return
/// complete rewrites of every relevant file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModificationStrategy {
    Incremental,
    FullRewrite,
}

/// Explorer configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Directory containing the test suite, relative to the project root.
    pub test_dir: String,

    /// Directory for exploration records, relative to the project root.
    pub record_dir: String,

    /// Iteration budget for one exploration.
    pub max_iterations: u32,

    pub provider: Provider,

    /// Model name passed through to the provider.
    pub model: String,

    /// Name of the environment variable holding the API key. The key itself
    /// is never written to config or records.
    pub api_key_env: String,

    /// Endpoint override; required when `provider = "other"`.
    pub base_url: Option<String>,

    /// Sampling temperature, 0.0 to 1.0.
    pub temperature: f32,

    /// How many recent attempts flow into each prompt.
    pub search_depth: u32,

    pub modification_strategy: ModificationStrategy,

    /// Wall-clock budget for one test-suite run in seconds.
    pub test_timeout_secs: u64,

    /// Per-request budget for the model API call in seconds.
    pub request_timeout_secs: u64,

    /// Truncate captured subprocess output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Drop low-priority prompt sections beyond this many bytes.
    pub prompt_budget_bytes: usize,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            test_dir: "tests".to_string(),
            record_dir: ".explorer/explorations".to_string(),
            max_iterations: 10,
            provider: Provider::Openai,
            model: "gpt-4".to_string(),
            api_key_env: "EXPLORER_API_KEY".to_string(),
            base_url: None,
            temperature: 0.7,
            search_depth: 3,
            modification_strategy: ModificationStrategy::Incremental,
            test_timeout_secs: 10 * 60,
            request_timeout_secs: 2 * 60,
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 40_000,
        }
    }
}

impl ExplorerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.test_dir.trim().is_empty() {
            return Err(anyhow!("test_dir must not be empty"));
        }
        if self.record_dir.trim().is_empty() {
            return Err(anyhow!("record_dir must not be empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        if self.api_key_env.trim().is_empty() {
            return Err(anyhow!("api_key_env must not be empty"));
        }
        if self.provider == Provider::Other && self.base_url.is_none() {
            return Err(anyhow!("base_url is required when provider = \"other\""));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(anyhow!(
                "temperature must be within 0.0..=1.0 (got {})",
                self.temperature
            ));
        }
        if self.search_depth == 0 {
            return Err(anyhow!("search_depth must be > 0"));
        }
        if self.test_timeout_secs == 0 {
            return Err(anyhow!("test_timeout_secs must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ExplorerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ExplorerConfig> {
    if !path.exists() {
        let cfg = ExplorerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ExplorerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ExplorerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ExplorerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = ExplorerConfig {
            provider: Provider::Deepseek,
            model: "deepseek-chat".to_string(),
            max_iterations: 5,
            ..ExplorerConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn zero_iterations_rejected() {
        let cfg = ExplorerConfig {
            max_iterations: 0,
            ..ExplorerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn other_provider_requires_base_url() {
        let cfg = ExplorerConfig {
            provider: Provider::Other,
            base_url: None,
            ..ExplorerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("base_url"));

        let cfg = ExplorerConfig {
            provider: Provider::Other,
            base_url: Some("http://localhost:8080/v1".to_string()),
            ..ExplorerConfig::default()
        };
        cfg.validate().expect("valid with base_url");
    }

    #[test]
    fn temperature_out_of_range_rejected() {
        let cfg = ExplorerConfig {
            temperature: 1.5,
            ..ExplorerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }
}
