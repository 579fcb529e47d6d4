//! Static checks run on a diff before it is sent for review.
//!
//! Two passes: a regex scan over added lines for credentials and high-risk
//! commands, and a glob check of every touched path against the blocked
//! list. Any hit blocks the diff without consulting the reasoning service.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::apply::diff;
use crate::runs::models::{ReviewIssue, ReviewResult, ReviewSource, RiskLevel};

/// Paths a generated diff may never touch.
pub const DEFAULT_BLOCKED_PATHS: &[&str] = &[
    ".env",
    ".env.*",
    "**/.env",
    "**/.env.*",
    "*.pem",
    "**/*.pem",
    "*.key",
    "**/*.key",
    "**/id_rsa*",
    ".git/**",
    "**/secrets/**",
    ".github/workflows/**",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyKind {
    Secret,
    DangerousCode,
    BlockedPath,
    Malformed,
}

impl SafetyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Secret => "secret",
            Self::DangerousCode => "dangerous_code",
            Self::BlockedPath => "blocked_path",
            Self::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyIssue {
    pub kind: SafetyKind,
    pub severity: RiskLevel,
    pub file: Option<String>,
    pub line: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafetyReport {
    pub issues: Vec<SafetyIssue>,
}

impl SafetyReport {
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }

    /// The review stored in place of a reasoning-service verdict.
    pub fn to_review(&self) -> ReviewResult {
        ReviewResult {
            safe_to_apply: false,
            risk_level: RiskLevel::Critical,
            issues: self
                .issues
                .iter()
                .map(|issue| ReviewIssue {
                    severity: issue.severity,
                    category: issue.kind.as_str().to_string(),
                    message: issue.message.clone(),
                    file: issue.file.clone(),
                    line: issue.line,
                })
                .collect(),
            summary: format!(
                "Safety gate blocked the diff: {} issue(s) found before review",
                self.issues.len()
            ),
            source: ReviewSource::SafetyGate,
        }
    }
}

struct ContentRule {
    kind: SafetyKind,
    severity: RiskLevel,
    message: &'static str,
    regex: Regex,
}

fn rule(kind: SafetyKind, severity: RiskLevel, message: &'static str, pattern: &str) -> ContentRule {
    ContentRule {
        kind,
        severity,
        message,
        regex: Regex::new(pattern).unwrap(),
    }
}

static CONTENT_RULES: LazyLock<Vec<ContentRule>> = LazyLock::new(|| {
    use RiskLevel::*;
    use SafetyKind::*;
    vec![
        rule(
            Secret,
            Critical,
            "private key material",
            r"-----BEGIN (?:RSA |EC |DSA |OPENSSH |PGP |ENCRYPTED )?PRIVATE KEY",
        ),
        rule(Secret, Critical, "AWS access key id", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b"),
        rule(Secret, Critical, "GitHub token", r"\bgh[pousr]_[A-Za-z0-9]{36,}\b"),
        rule(Secret, Critical, "Slack token", r"\bxox[abposr]-[A-Za-z0-9-]{10,}"),
        rule(Secret, Critical, "API secret key", r"\bsk-[A-Za-z0-9_-]{20,}"),
        rule(
            Secret,
            High,
            "hard-coded credential",
            r#"(?i)\b(?:password|passwd|secret|api[_-]?key|access[_-]?token|auth[_-]?token)\b["']?\s*[:=]\s*["'][^"'\s]{8,}["']"#,
        ),
        rule(
            DangerousCode,
            Critical,
            "recursive delete of the filesystem root or home",
            r"\brm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+(?:--no-preserve-root\s+)?(?:/|~)(?:\s|$|\*)",
        ),
        rule(
            DangerousCode,
            High,
            "downloaded script piped into a shell",
            r"\b(?:curl|wget)\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
        ),
        rule(
            DangerousCode,
            Medium,
            "world-writable permissions",
            r"\bchmod\s+(?:-R\s+)?0?777\b",
        ),
        rule(
            DangerousCode,
            High,
            "TLS certificate verification disabled",
            r#"(?i)(?:verify\s*=\s*false|InsecureSkipVerify\s*:\s*true|danger_accept_invalid_certs\s*\(\s*true|NODE_TLS_REJECT_UNAUTHORIZED\s*=\s*["']?0|rejectUnauthorized\s*:\s*false)"#,
        ),
    ]
});

static HUNK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -\d+(?:,\d+)? \+(\d+)(?:,\d+)? @@").unwrap());

/// Credential, dangerous-code and blocked-path checks.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    blocked: Vec<Pattern>,
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self {
            blocked: DEFAULT_BLOCKED_PATHS
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .collect(),
        }
    }
}

impl SafetyGate {
    /// The default blocked paths plus `extra` glob patterns.
    pub fn new(extra: &[String]) -> Result<Self> {
        let mut gate = Self::default();
        for pattern in extra {
            gate.blocked.push(
                Pattern::new(pattern)
                    .with_context(|| format!("Invalid blocked path pattern '{}'", pattern))?,
            );
        }
        Ok(gate)
    }

    pub fn check(&self, diff_text: &str) -> SafetyReport {
        let mut report = SafetyReport::default();
        self.check_paths(diff_text, &mut report);
        scan_added_lines(diff_text, &mut report);
        report
    }

    pub fn is_blocked(&self, path: &str) -> Option<&str> {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        // Match the path the applier would actually write.
        let path = diff::normalize(path);
        self.blocked
            .iter()
            .find(|p| p.matches_with(&path, options))
            .map(|p| p.as_str())
    }

    fn check_paths(&self, diff_text: &str, report: &mut SafetyReport) {
        let patches = match diff::parse(diff_text) {
            Ok(patches) => patches,
            Err(e) => {
                report.issues.push(SafetyIssue {
                    kind: SafetyKind::Malformed,
                    severity: RiskLevel::High,
                    file: None,
                    line: None,
                    message: format!("diff could not be parsed, touched paths unknown: {}", e),
                });
                return;
            }
        };
        for patch in &patches {
            for path in patch.touched_paths() {
                if let Some(pattern) = self.is_blocked(path) {
                    report.issues.push(SafetyIssue {
                        kind: SafetyKind::BlockedPath,
                        severity: RiskLevel::Critical,
                        file: Some(path.to_string()),
                        line: None,
                        message: format!("path matches blocked pattern '{}'", pattern),
                    });
                }
            }
        }
    }
}

/// Scan `+` lines (not `+++` headers), tracking file and new-side line numbers.
fn scan_added_lines(diff_text: &str, report: &mut SafetyReport) {
    let mut file: Option<String> = None;
    let mut line_no = 0usize;

    for line in diff_text.lines() {
        if let Some(rest) = line.strip_prefix("+++ ") {
            let path = rest.split('\t').next().unwrap_or(rest).trim();
            file = (path != "/dev/null")
                .then(|| path.strip_prefix("b/").unwrap_or(path).to_string());
            continue;
        }
        if let Some(caps) = HUNK_HEADER.captures(line) {
            line_no = caps[1].parse().unwrap_or(0);
            continue;
        }
        if let Some(added) = line.strip_prefix('+') {
            for rule in CONTENT_RULES.iter() {
                if rule.regex.is_match(added) {
                    report.issues.push(SafetyIssue {
                        kind: rule.kind,
                        severity: rule.severity,
                        file: file.clone(),
                        line: (line_no > 0).then_some(line_no),
                        message: rule.message.to_string(),
                    });
                }
            }
            line_no += 1;
        } else if line.starts_with(' ') {
            line_no += 1;
        }
    }
}
