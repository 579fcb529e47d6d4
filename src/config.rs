//! Configuration for coderun.
//!
//! Settings live in `<data_dir>/coderun.toml`; every section and field is
//! optional. Values are layered file → environment → CLI.
//!
//! ```toml
//! [worker]
//! budget_secs = 55
//! poll_interval_secs = 5
//! stuck_threshold_minutes = 30
//!
//! [queue]
//! default_priority = 5
//! max_attempts = 3
//! cleanup_days = 7
//!
//! [apply]
//! lock_wait_secs = 30
//! backup_retention_days = 14
//!
//! [safety]
//! blocked_paths = ["migrations/**"]
//!
//! [reasoning]
//! command = "claude"
//! timeout_secs = 300
//! max_file_bytes = 200000
//!
//! [checkpoint]
//! author_name = "coderun"
//! author_email = "coderun@localhost"
//!
//! [logging]
//! level = "info"
//! format = "text"
//! file = false
//! ```
//!
//! Environment overrides: `CODERUN_DATA_DIR`, `CODERUN_CLAUDE_CMD`,
//! `CODERUN_REASONING_TIMEOUT_SECS`, `CODERUN_LOG_LEVEL`,
//! `CODERUN_LOG_FORMAT`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "coderun.toml";
pub const DEFAULT_DATA_DIR: &str = ".coderun";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Wall-clock budget of one `drain` call.
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
    /// Tick interval of `worker --serve`.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Running jobs older than this are considered abandoned.
    #[serde(default = "default_stuck_threshold_minutes")]
    pub stuck_threshold_minutes: u64,
}

fn default_budget_secs() -> u64 {
    55
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_stuck_threshold_minutes() -> u64 {
    30
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            budget_secs: default_budget_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            stuck_threshold_minutes: default_stuck_threshold_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// 0 (soonest) to 10.
    #[serde(default = "default_priority")]
    pub default_priority: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// Age in days after which finished jobs are deleted by the cleanup job.
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: u64,
}

fn default_priority() -> i64 {
    5
}

fn default_max_attempts() -> i64 {
    3
}

fn default_cleanup_days() -> u64 {
    7
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            default_priority: default_priority(),
            max_attempts: default_max_attempts(),
            cleanup_days: default_cleanup_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySection {
    /// How long apply/rollback wait for the repo lock before giving up.
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: u64,
}

fn default_lock_wait_secs() -> u64 {
    30
}

fn default_backup_retention_days() -> u64 {
    14
}

impl Default for ApplySection {
    fn default() -> Self {
        Self {
            lock_wait_secs: default_lock_wait_secs(),
            backup_retention_days: default_backup_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetySection {
    /// Glob patterns blocked in addition to the built-in list.
    #[serde(default)]
    pub blocked_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSection {
    /// Claude CLI command.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Files larger than this are not sent as context.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Upper bound on the repository listing sent with each request.
    #[serde(default = "default_max_listing")]
    pub max_listing: usize,
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_file_bytes() -> u64 {
    200_000
}

fn default_max_listing() -> usize {
    500
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            model: None,
            timeout_secs: default_timeout_secs(),
            max_file_bytes: default_max_file_bytes(),
            max_listing: default_max_listing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_author_name() -> String {
    "coderun".to_string()
}

fn default_author_email() -> String {
    "coderun@localhost".to_string()
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write a daily rolling log file under `dir`.
    #[serde(default)]
    pub file: bool,
    /// Set from the data directory at load time.
    #[serde(skip)]
    pub dir: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            file: false,
            dir: None,
        }
    }
}

/// Contents of `coderun.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoderunToml {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub apply: ApplySection,
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub reasoning: ReasoningSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub logging: LogConfig,
}

impl CoderunToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse coderun.toml")
    }

    /// Load `<data_dir>/coderun.toml`, or defaults when it does not exist.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize coderun.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(0..=10).contains(&self.queue.default_priority) {
            warnings.push(format!(
                "queue.default_priority {} is outside 0-10",
                self.queue.default_priority
            ));
        }
        if self.queue.max_attempts < 1 {
            warnings.push("queue.max_attempts must be at least 1".to_string());
        }
        if self.worker.budget_secs == 0 {
            warnings.push("worker.budget_secs is 0: drain will not process any job".to_string());
        }
        if self.worker.poll_interval_secs == 0 {
            warnings.push("worker.poll_interval_secs must be at least 1".to_string());
        }
        if self.reasoning.timeout_secs == 0 {
            warnings.push("reasoning.timeout_secs is 0: every call will time out".to_string());
        }
        if self.reasoning.command.trim().is_empty() {
            warnings.push("reasoning.command is empty".to_string());
        }
        if !self.checkpoint.author_email.contains('@') {
            warnings.push(format!(
                "checkpoint.author_email '{}' does not look like an email address",
                self.checkpoint.author_email
            ));
        }
        for pattern in &self.safety.blocked_paths {
            if let Err(e) = glob::Pattern::new(pattern) {
                warnings.push(format!("Invalid safety.blocked_paths pattern '{}': {}", pattern, e));
            }
        }
        if self.logging.level.parse::<tracing_subscriber::EnvFilter>().is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }
}

/// Effective configuration: `coderun.toml` plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct CoderunConfig {
    pub data_dir: PathBuf,
    pub toml: CoderunToml,
    pub verbose: bool,
}

impl CoderunConfig {
    /// Resolve the data directory (CLI → `CODERUN_DATA_DIR` → `.coderun`)
    /// and load its config file.
    pub fn load(cli_data_dir: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let data_dir = cli_data_dir
            .or_else(|| std::env::var_os("CODERUN_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let mut toml = CoderunToml::load_or_default(&data_dir)?;
        apply_env_overrides(&mut toml)?;
        toml.logging.dir = Some(data_dir.join("logs"));
        Ok(Self {
            data_dir,
            toml,
            verbose,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("coderun.db")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.reasoning.timeout_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.toml.apply.lock_wait_secs)
    }

    pub fn worker_budget(&self) -> Duration {
        Duration::from_secs(self.toml.worker.budget_secs)
    }

    pub fn backup_retention(&self) -> Duration {
        Duration::from_secs(self.toml.apply.backup_retention_days * 24 * 3600)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn apply_env_overrides(toml: &mut CoderunToml) -> Result<()> {
    if let Ok(cmd) = std::env::var("CODERUN_CLAUDE_CMD")
        && !cmd.trim().is_empty()
    {
        toml.reasoning.command = cmd;
    }
    if let Ok(secs) = std::env::var("CODERUN_REASONING_TIMEOUT_SECS") {
        toml.reasoning.timeout_secs = secs
            .parse()
            .with_context(|| format!("Invalid CODERUN_REASONING_TIMEOUT_SECS '{}'", secs))?;
    }
    if let Ok(level) = std::env::var("CODERUN_LOG_LEVEL") {
        toml.logging.level = level;
    }
    if let Ok(format) = std::env::var("CODERUN_LOG_FORMAT") {
        toml.logging.format = format.parse()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_gives_defaults() {
        let toml = CoderunToml::parse("").unwrap();
        assert_eq!(toml.worker.budget_secs, 55);
        assert_eq!(toml.queue.default_priority, 5);
        assert_eq!(toml.queue.max_attempts, 3);
        assert_eq!(toml.reasoning.command, "claude");
        assert_eq!(toml.logging.format, LogFormat::Text);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let content = r#"
[apply]
lock_wait_secs = 2

[safety]
blocked_paths = ["migrations/**"]

[logging]
format = "json"
"#;
        let toml = CoderunToml::parse(content).unwrap();
        assert_eq!(toml.apply.lock_wait_secs, 2);
        assert_eq!(toml.apply.backup_retention_days, 14);
        assert_eq!(toml.safety.blocked_paths, vec!["migrations/**"]);
        assert_eq!(toml.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(CoderunToml::parse("[worker\nbudget_secs = ").is_err());
    }

    #[test]
    fn test_validate_reports_warnings() {
        let content = r#"
[queue]
default_priority = 42
max_attempts = 0

[safety]
blocked_paths = ["["]

[checkpoint]
author_email = "nobody"
"#;
        let warnings = CoderunToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 4, "{:?}", warnings);
        assert!(warnings.iter().any(|w| w.contains("default_priority")));
        assert!(warnings.iter().any(|w| w.contains("blocked_paths")));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut toml = CoderunToml::default();
        toml.worker.budget_secs = 10;
        toml.save(&dir.path().join(CONFIG_FILE)).unwrap();
        let loaded = CoderunToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.worker.budget_secs, 10);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let toml = CoderunToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.apply.lock_wait_secs, 30);
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[reasoning]\ncommand = \"file-claude\"\ntimeout_secs = 10\n",
        )
        .unwrap();

        let saved = std::env::var("CODERUN_CLAUDE_CMD").ok();
        unsafe { std::env::set_var("CODERUN_CLAUDE_CMD", "env-claude") };
        let config = CoderunConfig::load(Some(dir.path().to_path_buf()), false).unwrap();
        match saved {
            Some(val) => unsafe { std::env::set_var("CODERUN_CLAUDE_CMD", val) },
            None => unsafe { std::env::remove_var("CODERUN_CLAUDE_CMD") },
        }

        assert_eq!(config.toml.reasoning.command, "env-claude");
        assert_eq!(config.reasoning_timeout(), Duration::from_secs(10));
        assert_eq!(config.db_path(), dir.path().join("coderun.db"));
        assert_eq!(config.toml.logging.dir, Some(dir.path().join("logs")));
    }
}
