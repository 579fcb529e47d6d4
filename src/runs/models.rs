use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::apply::ApplyReport;

/// A registered target repository together with its write policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub name: String,
    pub base_path: String,
    pub read_only: bool,
    pub maintenance_locked: bool,
    pub allowed_path_prefixes: Vec<String>,
    pub created_at: String,
}

impl Repo {
    pub fn policy(&self) -> RepoPolicy {
        RepoPolicy {
            repo_id: self.id,
            base_path: PathBuf::from(&self.base_path),
            allowed_path_prefixes: self.allowed_path_prefixes.clone(),
            read_only: self.read_only,
            maintenance_locked: self.maintenance_locked,
        }
    }
}

/// Flags consulted by Apply for one target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPolicy {
    pub repo_id: i64,
    /// Absolute, canonicalized.
    pub base_path: PathBuf,
    /// Empty means everything under `base_path`.
    pub allowed_path_prefixes: Vec<String>,
    pub read_only: bool,
    pub maintenance_locked: bool,
}

impl RepoPolicy {
    /// Why writes are currently refused, if they are.
    pub fn write_block_reason(&self) -> Option<&'static str> {
        if self.read_only {
            Some("repository is read-only")
        } else if self.maintenance_locked {
            Some("repository is locked for maintenance")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Planning,
    Coding,
    Reviewing,
    Ready,
    Applying,
    Completed,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Reviewing => "reviewing",
            Self::Ready => "ready",
            Self::Applying => "applying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        super::state::is_valid_transition(*self, next)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "coding" => Ok(Self::Coding),
            "reviewing" => Ok(Self::Reviewing),
            "ready" => Ok(Self::Ready),
            "applying" => Ok(Self::Applying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// One discrete step of a run. Each execution produces a `RunStep`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Code,
    Review,
    Apply,
    Rollback,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Review => "review",
            Self::Apply => "apply",
            Self::Rollback => "rollback",
        }
    }

    /// The phase that follows this one in the plan → code → review → apply chain.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::Plan => Some(Self::Code),
            Self::Code => Some(Self::Review),
            Self::Review => Some(Self::Apply),
            Self::Apply | Self::Rollback => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "code" => Ok(Self::Code),
            "review" => Ok(Self::Review),
            "apply" => Ok(Self::Apply),
            "rollback" => Ok(Self::Rollback),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// Token usage reported by the reasoning service for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Structured plan produced by the plan phase.
///
/// Only `files` is interpreted by coderun (it drives the file contents handed
/// to code generation); everything else is carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanArtifact {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
    /// Repository-relative paths the change is expected to touch.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewIssue {
    pub severity: RiskLevel,
    #[serde(default)]
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

/// Who produced a review verdict.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewSource {
    /// Static checks rejected the diff; the reasoning service was never asked.
    SafetyGate,
    #[default]
    Reasoning,
}

/// Verdict of the review phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewResult {
    pub safe_to_apply: bool,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub source: ReviewSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub repo_id: i64,
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
    pub request_text: String,
    pub status: RunStatus,
    pub plan_artifact: Option<PlanArtifact>,
    pub diff_content: Option<String>,
    pub review_result: Option<ReviewResult>,
    pub git_checkpoint: Option<String>,
    pub applied_commit: Option<String>,
    pub apply_report: Option<ApplyReport>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Run {
    pub fn review_approved(&self) -> bool {
        self.review_result
            .as_ref()
            .is_some_and(|review| review.safe_to_apply)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: i64,
    pub run_id: i64,
    pub phase: Phase,
    pub status: StepStatus,
    pub output_artifact: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub usage: Usage,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Fields written to a run when a phase finishes successfully.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub plan_artifact: Option<PlanArtifact>,
    pub diff_content: Option<String>,
    pub review_result: Option<ReviewResult>,
    pub applied_commit: Option<String>,
    pub apply_report: Option<ApplyReport>,
    pub error_message: Option<String>,
}

/// Run together with its step history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub steps: Vec<RunStep>,
}
