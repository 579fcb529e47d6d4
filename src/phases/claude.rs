use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::context::RepoContext;
use super::reasoning::{FileContents, Reasoned, ReasoningService};
use crate::config::ReasoningSection;
use crate::errors::{ServiceError, ServiceErrorKind};
use crate::runs::models::{PlanArtifact, ReviewResult, ReviewSource, Usage};

const PLAN_SYSTEM_PROMPT: &str = r#"You are a software engineering planner. Read the change request and the repository listing and produce a plan.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "summary": "One paragraph describing the change",
  "steps": ["Ordered, concrete edit steps"],
  "files": ["repository/relative/paths/the/change/touches"]
}

Rules:
- List every file that must be created, modified or deleted in "files".
- Paths are relative to the repository root and use forward slashes.
- Keep the plan minimal. Do not plan unrelated refactors.
"#;

const CODE_SYSTEM_PROMPT: &str = r#"You are a careful software engineer. Implement the given plan as a single unified diff.

Rules:
- Respond with the diff only, inside one ```diff fenced block.
- Use git-style headers: "diff --git a/PATH b/PATH", "--- a/PATH", "+++ b/PATH".
- New files use "--- /dev/null"; deleted files use "+++ /dev/null".
- Hunk context must match the provided file contents exactly.
- Do not rename files. Do not touch files outside the plan unless required.
"#;

const REVIEW_SYSTEM_PROMPT: &str = r#"You are a security-minded code reviewer. Decide whether the diff is safe to apply automatically.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "safe_to_apply": true | false,
  "risk_level": "low" | "medium" | "high" | "critical",
  "summary": "Short verdict",
  "issues": [
    {"severity": "low" | "medium" | "high" | "critical", "category": "bug|security|scope|style", "message": "...", "file": "path", "line": 1}
  ]
}

Mark the diff unsafe if it leaks secrets, weakens security, deletes data unexpectedly, or does not implement the plan.
"#;

/// Response envelope of `claude --print --output-format json`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Option<EnvelopeUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// `ReasoningService` backed by the `claude` command line tool.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    command: String,
    model: Option<String>,
    timeout: Duration,
}

impl ClaudeCli {
    pub fn new(command: impl Into<String>, model: Option<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            model,
            timeout,
        }
    }

    pub fn from_config(section: &ReasoningSection) -> Self {
        Self::new(
            section.command.clone(),
            section.model.clone(),
            Duration::from_secs(section.timeout_secs),
        )
    }

    /// Run one prompt and return the response text with its usage.
    async fn call(
        &self,
        system_prompt: &str,
        prompt: &str,
        context: &RepoContext,
    ) -> Result<(String, Usage), ServiceError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(["--print", "--output-format", "json", "--system-prompt", system_prompt]);
        if let Some(model) = &self.model {
            cmd.args(["--model", model]);
        }
        cmd.current_dir(&context.base_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServiceError::offline(format!("'{}' is not installed or not on PATH", self.command))
            } else {
                ServiceError::new(
                    ServiceErrorKind::Other,
                    format!("failed to start '{}': {}", self.command, e),
                )
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await.map_err(|e| {
                ServiceError::new(ServiceErrorKind::Other, format!("failed to send prompt: {}", e))
            })?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ServiceError::new(
                    ServiceErrorKind::Other,
                    format!("failed to read '{}' output: {}", self.command, e),
                ));
            }
            Err(_) => {
                return Err(ServiceError::timeout(format!(
                    "no response after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            warn!(status = ?output.status.code(), "reasoning command failed");
            return Err(classify_failure(&detail));
        }
        parse_envelope(&stdout)
    }
}

#[async_trait]
impl ReasoningService for ClaudeCli {
    async fn plan(
        &self,
        request_text: &str,
        context: &RepoContext,
    ) -> Result<Reasoned<PlanArtifact>, ServiceError> {
        let prompt = format!(
            "Plan this change request.\n\n\
             ## Request\n{}\n\n\
             ## Repository: {}\n\
             ```\n{}\n```\n\n\
             Respond with JSON only.",
            request_text,
            context.name,
            context.listing(),
        );
        let (text, usage) = self.call(PLAN_SYSTEM_PROMPT, &prompt, context).await?;
        let plan: PlanArtifact = extract_json(&text)?;
        debug!(files = plan.files.len(), "plan parsed");
        Ok(Reasoned::new(plan, usage))
    }

    async fn generate_code(
        &self,
        plan: &PlanArtifact,
        context: &RepoContext,
        files: &FileContents,
    ) -> Result<Reasoned<String>, ServiceError> {
        let plan_json = serde_json::to_string_pretty(plan)
            .map_err(|e| ServiceError::new(ServiceErrorKind::Other, e.to_string()))?;
        let mut prompt = format!(
            "Implement this plan for the request below.\n\n\
             ## Request\n{}\n\n\
             ## Plan\n```json\n{}\n```\n\n\
             ## Current file contents\n",
            context.request_text, plan_json,
        );
        for (path, content) in files {
            prompt.push_str(&format!("\n### {}\n```\n{}\n```\n", path, content));
        }
        for path in plan.files.iter().filter(|p| !files.contains_key(*p)) {
            prompt.push_str(&format!("\n### {}\n(does not exist yet)\n", path));
        }
        let (text, usage) = self.call(CODE_SYSTEM_PROMPT, &prompt, context).await?;
        Ok(Reasoned::new(extract_diff(&text)?, usage))
    }

    async fn review(
        &self,
        diff: &str,
        plan: &PlanArtifact,
        context: &RepoContext,
    ) -> Result<Reasoned<ReviewResult>, ServiceError> {
        let prompt = format!(
            "Review this diff.\n\n\
             ## Request\n{}\n\n\
             ## Plan summary\n{}\n\n\
             ## Diff\n```diff\n{}\n```\n\n\
             Respond with JSON only.",
            context.request_text, plan.summary, diff,
        );
        let (text, usage) = self.call(REVIEW_SYSTEM_PROMPT, &prompt, context).await?;
        let mut review: ReviewResult = extract_json(&text)?;
        review.source = ReviewSource::Reasoning;
        Ok(Reasoned::new(review, usage))
    }
}

/// Parse the JSON envelope printed by the CLI.
fn parse_envelope(stdout: &str) -> Result<(String, Usage), ServiceError> {
    let envelope: Envelope = serde_json::from_str(stdout.trim()).map_err(|e| {
        ServiceError::invalid_response(format!("unreadable CLI output: {}", e))
    })?;
    if envelope.is_error {
        return Err(classify_failure(&envelope.result));
    }
    let usage = envelope.usage.unwrap_or_default();
    Ok((
        envelope.result,
        Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        },
    ))
}

/// Sort a failure message into a `ServiceError` category.
fn classify_failure(detail: &str) -> ServiceError {
    let lower = detail.to_lowercase();
    const AUTH: &[&str] = &[
        "api key",
        "api_key",
        "unauthorized",
        "401",
        "403",
        "authentication",
        "not logged in",
        "login",
    ];
    const NETWORK: &[&str] = &[
        "connection refused",
        "network",
        "could not resolve",
        "dns",
        "econnrefused",
        "enotfound",
        "offline",
        "unreachable",
        "overloaded",
        "503",
    ];
    if AUTH.iter().any(|k| lower.contains(k)) {
        ServiceError::auth(detail)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ServiceError::timeout(detail)
    } else if NETWORK.iter().any(|k| lower.contains(k)) {
        ServiceError::offline(detail)
    } else {
        ServiceError::new(ServiceErrorKind::Other, detail)
    }
}

/// Deserialize the JSON object embedded in `text`, tolerating markdown
/// fences or prose around it.
fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T, ServiceError> {
    let cleaned = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    };
    serde_json::from_str(cleaned).map_err(|e| {
        let preview: String = text.chars().take(200).collect();
        ServiceError::invalid_response(format!("expected JSON ({}): {}", e, preview))
    })
}

/// Pull the unified diff out of a response.
///
/// Prefers the first ```diff (or ```patch) fence; otherwise takes everything
/// from the first `diff --git` or `--- ` line.
fn extract_diff(text: &str) -> Result<String, ServiceError> {
    for fence in ["```diff", "```patch"] {
        if let Some(start) = text.find(fence) {
            let body = &text[start + fence.len()..];
            let body = body.strip_prefix('\n').or_else(|| body.strip_prefix("\r\n"));
            if let Some(body) = body {
                let end = body.find("\n```").map(|i| i + 1).unwrap_or(body.len());
                return non_empty(&body[..end]);
            }
        }
    }
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with("diff --git ") || line.starts_with("--- ") {
            let rest = &text[offset..];
            let end = rest.find("\n```").map(|i| i + 1).unwrap_or(rest.len());
            return non_empty(&rest[..end]);
        }
        offset += line.len();
    }
    Err(ServiceError::invalid_response("response contains no unified diff"))
}

fn non_empty(diff: &str) -> Result<String, ServiceError> {
    if diff.trim().is_empty() {
        Err(ServiceError::invalid_response("response contains an empty diff"))
    } else {
        let mut diff = diff.to_string();
        if !diff.ends_with('\n') {
            diff.push('\n');
        }
        Ok(diff)
    }
}
