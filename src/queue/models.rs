use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::QueueError;
use crate::runs::models::Phase;

/// Lowest and highest accepted priority; lower runs sooner.
pub const PRIORITY_RANGE: (i64, i64) = (0, 10);
pub const DEFAULT_PRIORITY: i64 = 5;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Plan,
    Code,
    Review,
    Apply,
    Cleanup,
    BackupCleanup,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Review => "review",
            Self::Apply => "apply",
            Self::Cleanup => "cleanup",
            Self::BackupCleanup => "backup-cleanup",
        }
    }

    /// The run phase this job executes, for phase jobs.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Plan => Some(Phase::Plan),
            Self::Code => Some(Phase::Code),
            Self::Review => Some(Phase::Review),
            Self::Apply => Some(Phase::Apply),
            Self::Cleanup | Self::BackupCleanup => None,
        }
    }

    /// Rollback is never queued; it is always an explicit request.
    pub fn for_phase(phase: Phase) -> Option<Self> {
        match phase {
            Phase::Plan => Some(Self::Plan),
            Phase::Code => Some(Self::Code),
            Phase::Review => Some(Self::Review),
            Phase::Apply => Some(Self::Apply),
            Phase::Rollback => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "code" => Ok(Self::Code),
            "review" => Ok(Self::Review),
            "apply" => Ok(Self::Apply),
            "cleanup" => Ok(Self::Cleanup),
            "backup-cleanup" => Ok(Self::BackupCleanup),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// A queued unit of work. Times are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_id: Option<i64>,
    pub user_id: Option<String>,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl Job {
    /// The run a phase job targets: `payload.run_id`, else the `run_id` column.
    pub fn target_run(&self) -> Result<i64, QueueError> {
        self.payload
            .get("run_id")
            .and_then(|v| v.as_i64())
            .or(self.run_id)
            .ok_or_else(|| QueueError::InvalidPayload {
                id: self.id,
                message: "missing run_id".to_string(),
            })
    }

    /// Optional unsigned integer field of the payload.
    pub fn payload_u64(&self, key: &str) -> Result<Option<u64>, QueueError> {
        match self.payload.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v.as_u64().map(Some).ok_or_else(|| QueueError::InvalidPayload {
                id: self.id,
                message: format!("{} must be a non-negative integer", key),
            }),
        }
    }
}

/// Options for [`JobQueue::push`](super::JobQueue::push).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOptions {
    pub priority: i64,
    pub max_attempts: i64,
    pub run_id: Option<i64>,
    pub user_id: Option<String>,
    /// Epoch milliseconds; `None` means now.
    pub scheduled_at: Option<i64>,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_id: None,
            user_id: None,
            scheduled_at: None,
        }
    }
}

impl PushOptions {
    pub fn for_run(mut self, run_id: i64) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// What happened to a job reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FailOutcome {
    /// Back to `pending`, eligible again at `scheduled_at`.
    Retrying { scheduled_at: i64 },
    /// Out of attempts; the job is `failed` for good.
    Exhausted,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub by_status: BTreeMap<String, i64>,
    pub by_type: BTreeMap<String, i64>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(payload: serde_json::Value, run_id: Option<i64>) -> Job {
        Job {
            id: 9,
            job_type: JobType::Plan,
            payload,
            priority: DEFAULT_PRIORITY,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_id,
            user_id: None,
            scheduled_at: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_job_type_round_trips_through_str() {
        for t in [
            JobType::Plan,
            JobType::Code,
            JobType::Review,
            JobType::Apply,
            JobType::Cleanup,
            JobType::BackupCleanup,
        ] {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
        assert!("bogus".parse::<JobType>().is_err());
        assert_eq!(
            serde_json::to_string(&JobType::BackupCleanup).unwrap(),
            "\"backup-cleanup\""
        );
    }

    #[test]
    fn test_rollback_has_no_job_type() {
        assert_eq!(JobType::for_phase(Phase::Rollback), None);
        assert_eq!(JobType::for_phase(Phase::Apply), Some(JobType::Apply));
        assert_eq!(JobType::Cleanup.phase(), None);
    }

    #[test]
    fn test_target_run_prefers_payload() {
        assert_eq!(job(json!({"run_id": 4}), Some(7)).target_run().unwrap(), 4);
        assert_eq!(job(json!({}), Some(7)).target_run().unwrap(), 7);
        assert!(matches!(
            job(json!({}), None).target_run(),
            Err(QueueError::InvalidPayload { id: 9, .. })
        ));
    }

    #[test]
    fn test_payload_u64() {
        let j = job(json!({"days": 3, "bad": -1}), None);
        assert_eq!(j.payload_u64("days").unwrap(), Some(3));
        assert_eq!(j.payload_u64("missing").unwrap(), None);
        assert!(j.payload_u64("bad").is_err());
    }
}
