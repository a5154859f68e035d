//! Chat-completions client for patch generation.
//!
//! One logical operation: given a prompt, return the model's text. OpenAI and
//! DeepSeek both speak the OpenAI chat-completions protocol, so a single
//! client covers every configured provider; `other` just points the same
//! request at a custom endpoint.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::config::{ExplorerConfig, Provider};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";

/// The model call failed or returned unusable output. Retryable, in contrast
/// to "the model answered but the tests still fail".
#[derive(Debug, Clone)]
pub struct PatchGenerationError {
    pub reason: String,
}

impl PatchGenerationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PatchGenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch generation failed: {}", self.reason)
    }
}

impl std::error::Error for PatchGenerationError {}

/// One completion request: a system instruction plus the user prompt.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

/// Abstraction over the hosted model API.
///
/// The exploration engine never sees HTTP; tests substitute scripted clients.
pub trait ModelClient {
    /// Return the raw text of the model's reply.
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Blocking chat-completions client.
pub struct ChatCompletionsClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl ChatCompletionsClient {
    /// Build a client from config. The API key is read from the environment
    /// variable named by `api_key_env`; the literal secret never appears in
    /// config or records.
    pub fn from_config(config: &ExplorerConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).with_context(|| {
            format!(
                "API key environment variable '{}' is not set",
                config.api_key_env
            )
        })?;
        let base_url = match config.provider {
            Provider::Openai => config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            Provider::Deepseek => config
                .base_url
                .clone()
                .unwrap_or_else(|| DEEPSEEK_BASE_URL.to_string()),
            Provider::Other => config
                .base_url
                .clone()
                .ok_or_else(|| anyhow!("provider 'other' requires base_url"))?,
        };
        let http = reqwest::blocking::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }
}

impl ModelClient for ChatCompletionsClient {
    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: request.user.clone(),
                },
            ],
            temperature: request.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, "sending completion request");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .map_err(|e| {
                warn!(err = %e, "completion request failed");
                anyhow!(PatchGenerationError::new(format!("request failed: {e}")))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            warn!(status = %status, "completion request rejected");
            return Err(anyhow!(PatchGenerationError::new(format!(
                "API error {status}: {}",
                text.trim()
            ))));
        }

        let parsed: ChatResponse = response.json().map_err(|e| {
            anyhow!(PatchGenerationError::new(format!(
                "malformed API response: {e}"
            )))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(anyhow!(PatchGenerationError::new(
                "empty completion in API response"
            )));
        }
        debug!(bytes = content.len(), "completion received");
        Ok(content)
    }
}
