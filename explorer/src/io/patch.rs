//! Patch generation and application.
//!
//! [`ModelPatchGenerator`] turns a [`FailureContext`] into a prompt, asks the
//! model client for a completion, and parses the reply into a validated
//! [`PatchCandidate`]. [`apply_patch`] then overwrites the named files on
//! disk. Any malformed model output surfaces as [`PatchGenerationError`] so
//! the engine can retry the call without burning an iteration.

use std::fs;
use std::path::{Component, Path};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::PatchCandidate;
use crate::io::config::ModificationStrategy;
use crate::io::context::FailureContext;
use crate::io::model::{CompletionRequest, ModelClient, PatchGenerationError};

const PATCH_TEMPLATE: &str = include_str!("prompts/patch.md");
const PATCH_SCHEMA: &str = include_str!("../../schemas/patch_candidate.schema.json");

const SYSTEM_PROMPT: &str = "You are an automated code repair assistant. You receive failing \
     test output and source files and respond with strict JSON describing complete new file \
     contents. You never explain, apologize, or emit anything outside the JSON object.";

/// Abstraction over patch proposal.
///
/// The engine only sees this trait; tests script candidates directly.
pub trait PatchGenerator {
    fn propose(&self, ctx: &FailureContext) -> Result<PatchCandidate>;
}

#[derive(Debug, Clone, Serialize)]
struct FailureLine {
    id: String,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct SourceFile {
    path: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct AttemptLine {
    iter: u32,
    summary: String,
    files: Vec<String>,
    failed: Vec<String>,
}

/// Patch generator backed by a chat-completions model.
pub struct ModelPatchGenerator<C> {
    client: C,
    temperature: f32,
    strategy: ModificationStrategy,
    budget_bytes: usize,
}

impl<C: ModelClient> ModelPatchGenerator<C> {
    pub fn new(
        client: C,
        temperature: f32,
        strategy: ModificationStrategy,
        budget_bytes: usize,
    ) -> Self {
        Self {
            client,
            temperature,
            strategy,
            budget_bytes,
        }
    }

    fn build_prompt(&self, ctx: &FailureContext) -> Result<String> {
        let failures: Vec<FailureLine> = ctx
            .report
            .failed
            .iter()
            .map(|(id, message)| FailureLine {
                id: id.clone(),
                message: message.clone(),
            })
            .collect();
        let sources: Vec<SourceFile> = ctx
            .sources
            .iter()
            .map(|(path, content)| SourceFile {
                path: path.clone(),
                content: content.clone(),
            })
            .collect();
        let history: Vec<AttemptLine> = ctx
            .history
            .iter()
            .map(|attempt| AttemptLine {
                iter: attempt.iter,
                summary: attempt
                    .patch
                    .summary
                    .clone()
                    .unwrap_or_else(|| "no summary".to_string()),
                files: attempt.patch.files.keys().cloned().collect(),
                failed: attempt.tests.failed.keys().cloned().collect(),
            })
            .collect();

        let mut env = Environment::new();
        env.add_template("patch", PATCH_TEMPLATE)
            .expect("patch template should be valid");
        let template = env.get_template("patch")?;
        let strategy = match self.strategy {
            ModificationStrategy::Incremental => "incremental",
            ModificationStrategy::FullRewrite => "full-rewrite",
        };
        let rendered = template.render(context! {
            strategy => strategy,
            failures => failures,
            sources => sources,
            history => (!history.is_empty()).then_some(history),
        })?;

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

impl<C: ModelClient> PatchGenerator for ModelPatchGenerator<C> {
    #[instrument(skip_all, fields(failed = ctx.report.failed.len()))]
    fn propose(&self, ctx: &FailureContext) -> Result<PatchCandidate> {
        let prompt = self.build_prompt(ctx)?;
        debug!(prompt_bytes = prompt.len(), "requesting patch candidate");
        let reply = self.client.complete(&CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: prompt,
            temperature: self.temperature,
        })?;
        parse_candidate(&reply)
    }
}

/// Parse the model reply into a validated candidate.
///
/// Accepts raw JSON or JSON wrapped in a markdown code fence. Raw JSON is
/// tried first so a valid reply whose string values happen to contain fences
/// is never mangled by fence extraction.
pub fn parse_candidate(reply: &str) -> Result<PatchCandidate> {
    let value = parse_json_reply(reply)?;
    validate_candidate_schema(&value)?;
    let candidate: PatchCandidate = serde_json::from_value(value).map_err(|e| {
        anyhow!(PatchGenerationError::new(format!(
            "candidate does not match expected shape: {e}"
        )))
    })?;
    for (path, content) in &candidate.files {
        if content.trim().is_empty() {
            return Err(anyhow!(PatchGenerationError::new(format!(
                "empty content proposed for '{path}'"
            ))));
        }
    }
    Ok(candidate)
}

/// Validate candidate JSON against the embedded schema (Draft 2020-12).
fn validate_candidate_schema(instance: &Value) -> Result<()> {
    static SCHEMA: LazyLock<Value> = LazyLock::new(|| {
        serde_json::from_str(PATCH_SCHEMA).expect("embedded patch schema should be valid JSON")
    });
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&SCHEMA)
        .context("compile patch candidate schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        return Ok(());
    }
    Err(anyhow!(PatchGenerationError::new(format!(
        "candidate failed schema validation: {}",
        messages.join("; ")
    ))))
}

/// Parse the reply as JSON, falling back to fence extraction.
fn parse_json_reply(reply: &str) -> Result<Value> {
    static FENCE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap()
    });

    let trimmed = reply.trim();
    let raw_err = match serde_json::from_str(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    if let Some(caps) = FENCE_RE.captures(reply) {
        if let Some(inner) = caps.get(1) {
            if let Ok(value) = serde_json::from_str(inner.as_str()) {
                return Ok(value);
            }
        }
    }
    warn!(err = %raw_err, "model reply is not JSON");
    Err(anyhow!(PatchGenerationError::new(format!(
        "model reply is not valid JSON: {raw_err}"
    ))))
}

/// Write every proposed file, returning the relative paths written.
///
/// Each entry fully replaces the file content. Paths must stay inside the
/// project root: absolute paths and `..` components are rejected before
/// anything touches the disk.
#[instrument(skip_all, fields(files = candidate.files.len()))]
pub fn apply_patch(root: &Path, candidate: &PatchCandidate) -> Result<Vec<String>> {
    for path in candidate.files.keys() {
        validate_patch_path(path)?;
    }
    let mut written = Vec::new();
    for (rel, content) in &candidate.files {
        let abs = root.join(rel);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&abs, content).with_context(|| format!("write {}", abs.display()))?;
        debug!(path = %rel, bytes = content.len(), "patched file");
        written.push(rel.clone());
    }
    Ok(written)
}

fn validate_patch_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(anyhow!("patch path '{path}' is absolute"));
    }
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(anyhow!("patch path '{path}' escapes the project root")),
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Sections are delimited by `<!-- section:KEY required|droppable -->`.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in matches.iter().enumerate() {
        let key = caps.get(1).map_or("", |m| m.as_str()).to_string();
        let required = caps.get(2).map_or("", |m| m.as_str()) == "required";
        let start = caps.get(0).map_or(0, |m| m.end());
        let end = matches
            .get(i + 1)
            .and_then(|m| m.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key,
                required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections, then truncate the history tail if still over.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    while total_len(sections) > budget {
        let Some(idx) = sections.iter().position(|s| !s.required) else {
            break;
        };
        debug!(
            section = %sections[idx].key,
            bytes_dropped = sections[idx].content.len(),
            "dropped prompt section for budget"
        );
        sections.remove(idx);
    }

    let total = total_len(sections);
    if total > budget {
        if let Some(last) = sections.last_mut() {
            let other_len = total - last.content.len();
            let allowed = budget.saturating_sub(other_len);
            if last.content.len() > allowed && allowed > 12 {
                truncate_at_char_boundary(&mut last.content, allowed - 12);
                last.content.push_str("\n[truncated]");
            }
        }
    }
}

/// `String::truncate` panics mid-codepoint; walk back to a boundary first.
fn truncate_at_char_boundary(s: &mut String, max_len: usize) {
    let mut cut = max_len.min(s.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
