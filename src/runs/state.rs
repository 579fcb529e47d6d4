//! Run status lifecycle.
//!
//! ```text
//! pending → planning → coding → reviewing → ready → applying → completed
//!                                    │                  │          │
//!                                    └──→ failed ←──────┘          │
//!                        {completed, failed, applying} → rolled_back
//! ```
//!
//! Cancellation moves any pre-apply status to `failed`. A phase that raises
//! an error moves its in-progress status to `failed`.

use super::models::{Phase, Run, RunStatus};

/// Check if a run can be cancelled.
pub fn is_cancellable(status: RunStatus) -> bool {
    matches!(
        status,
        RunStatus::Pending
            | RunStatus::Planning
            | RunStatus::Coding
            | RunStatus::Reviewing
            | RunStatus::Ready
    )
}

/// Check if a run's status allows a rollback (a checkpoint is also required).
pub fn is_rollbackable(status: RunStatus) -> bool {
    matches!(
        status,
        RunStatus::Completed | RunStatus::Failed | RunStatus::Applying
    )
}

/// Validate that a run status transition is legal.
pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Pending, Planning)
            | (Planning, Coding)
            | (Coding, Reviewing)
            | (Reviewing, Ready)
            | (Reviewing, Failed)
            | (Ready, Applying)
            | (Applying, Completed)
            | (Applying, Failed)
            | (Completed, RolledBack)
            | (Failed, RolledBack)
            | (Applying, RolledBack)
            // cancellation and phase errors
            | (Pending, Failed)
            | (Planning, Failed)
            | (Coding, Failed)
            | (Ready, Failed)
    )
}

/// The status a run moves into when `phase` starts, and the statuses it may
/// start from.
///
/// The second list contains the phase's own in-progress status: a phase left
/// behind by a crashed worker can be resumed as long as it did not store its
/// output (see [`phase_output_missing`]).
pub fn phase_entry(phase: Phase) -> (RunStatus, &'static [RunStatus]) {
    match phase {
        Phase::Plan => (RunStatus::Planning, &[RunStatus::Pending, RunStatus::Planning]),
        Phase::Code => (RunStatus::Coding, &[RunStatus::Planning, RunStatus::Coding]),
        Phase::Review => (RunStatus::Reviewing, &[RunStatus::Coding, RunStatus::Reviewing]),
        Phase::Apply => (RunStatus::Applying, &[RunStatus::Ready]),
        Phase::Rollback => (
            RunStatus::RolledBack,
            &[RunStatus::Completed, RunStatus::Failed, RunStatus::Applying],
        ),
    }
}

/// Whether the output a phase would produce is still absent on `run`.
pub fn phase_output_missing(phase: Phase, run: &Run) -> bool {
    match phase {
        Phase::Plan => run.plan_artifact.is_none(),
        Phase::Code => run.diff_content.is_none(),
        Phase::Review => run.review_result.is_none(),
        Phase::Apply | Phase::Rollback => true,
    }
}

/// Check the guard for starting `phase` on `run`.
///
/// Returns a human-readable reason when the guard is violated. Repo policy is
/// checked separately because it needs the repo record.
pub fn check_phase_guard(phase: Phase, run: &Run) -> Result<(), String> {
    if run.status.is_terminal() && phase != Phase::Rollback {
        return Err(format!("run is already {}", run.status));
    }
    let (entered, allowed) = phase_entry(phase);
    if !allowed.contains(&run.status) {
        return Err(format!(
            "{} requires status {}",
            phase,
            allowed
                .iter()
                .filter(|s| **s != entered || phase == Phase::Rollback)
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" or ")
        ));
    }
    let resuming = run.status == entered && phase != Phase::Rollback;
    if resuming && !phase_output_missing(phase, run) {
        return Err(format!("{} already finished for this run", phase));
    }
    match phase {
        Phase::Plan => Ok(()),
        Phase::Code => {
            if run.plan_artifact.is_none() {
                Err("code requires a stored plan".to_string())
            } else {
                Ok(())
            }
        }
        Phase::Review => {
            if run.diff_content.is_none() {
                Err("review requires stored diff content".to_string())
            } else {
                Ok(())
            }
        }
        Phase::Apply => {
            if run.diff_content.is_none() {
                Err("apply requires stored diff content".to_string())
            } else if !run.review_approved() {
                Err("apply requires a review marked safe to apply".to_string())
            } else {
                Ok(())
            }
        }
        Phase::Rollback => {
            if run.git_checkpoint.is_none() {
                Err("rollback requires a git checkpoint".to_string())
            } else {
                Ok(())
            }
        }
    }
}

/// The phase a queued run should execute next, if any.
pub fn next_phase(run: &Run) -> Option<Phase> {
    match run.status {
        RunStatus::Pending => Some(Phase::Plan),
        RunStatus::Planning if run.plan_artifact.is_none() => Some(Phase::Plan),
        RunStatus::Planning => Some(Phase::Code),
        RunStatus::Coding if run.diff_content.is_none() => Some(Phase::Code),
        RunStatus::Coding => Some(Phase::Review),
        RunStatus::Reviewing => Some(Phase::Review),
        RunStatus::Ready => Some(Phase::Apply),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::models::{PlanArtifact, ReviewResult, RiskLevel, ReviewSource};

    const ALL: [RunStatus; 9] = [
        RunStatus::Pending,
        RunStatus::Planning,
        RunStatus::Coding,
        RunStatus::Reviewing,
        RunStatus::Ready,
        RunStatus::Applying,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::RolledBack,
    ];

    fn run_in(status: RunStatus) -> Run {
        Run {
            id: 1,
            repo_id: 1,
            user_id: None,
            thread_id: None,
            request_text: "add a README".into(),
            status,
            plan_artifact: None,
            diff_content: None,
            review_result: None,
            git_checkpoint: None,
            applied_commit: None,
            apply_report: None,
            error_message: None,
            created_at: String::new(),
            updated_at: String::new(),
            completed_at: None,
        }
    }

    fn approved() -> ReviewResult {
        ReviewResult {
            safe_to_apply: true,
            risk_level: RiskLevel::Low,
            issues: vec![],
            summary: String::new(),
            source: ReviewSource::Reasoning,
        }
    }

    #[test]
    fn test_valid_transitions() {
        assert!(is_valid_transition(RunStatus::Pending, RunStatus::Planning));
        assert!(is_valid_transition(RunStatus::Reviewing, RunStatus::Ready));
        assert!(is_valid_transition(RunStatus::Reviewing, RunStatus::Failed));
        assert!(is_valid_transition(RunStatus::Applying, RunStatus::Completed));
        assert!(is_valid_transition(RunStatus::Completed, RunStatus::RolledBack));
        assert!(is_valid_transition(RunStatus::Applying, RunStatus::RolledBack));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!is_valid_transition(RunStatus::Pending, RunStatus::Coding));
        assert!(!is_valid_transition(RunStatus::Planning, RunStatus::Ready));
        assert!(!is_valid_transition(RunStatus::Ready, RunStatus::Completed));
        assert!(!is_valid_transition(RunStatus::Completed, RunStatus::Failed));
        assert!(!is_valid_transition(RunStatus::RolledBack, RunStatus::Pending));
        assert!(!is_valid_transition(RunStatus::Pending, RunStatus::RolledBack));
    }

    #[test]
    fn test_terminal_states_have_no_exits_except_rollback() {
        for to in ALL {
            assert!(!is_valid_transition(RunStatus::RolledBack, to));
            if to != RunStatus::RolledBack {
                assert!(!is_valid_transition(RunStatus::Completed, to));
                assert!(!is_valid_transition(RunStatus::Failed, to));
            }
        }
    }

    #[test]
    fn test_phase_entries_are_valid_transitions() {
        for phase in [Phase::Plan, Phase::Code, Phase::Review, Phase::Apply, Phase::Rollback] {
            let (to, from) = phase_entry(phase);
            for status in from {
                if *status != to {
                    assert!(is_valid_transition(*status, to), "{status} -> {to}");
                }
            }
        }
    }

    #[test]
    fn test_is_cancellable() {
        assert!(is_cancellable(RunStatus::Pending));
        assert!(is_cancellable(RunStatus::Ready));
        assert!(!is_cancellable(RunStatus::Applying));
        assert!(!is_cancellable(RunStatus::Completed));
        assert!(!is_cancellable(RunStatus::RolledBack));
        for status in ALL.into_iter().filter(|s| is_cancellable(*s)) {
            assert!(is_valid_transition(status, RunStatus::Failed));
        }
    }

    #[test]
    fn test_code_guard_requires_plan() {
        let mut run = run_in(RunStatus::Planning);
        assert!(check_phase_guard(Phase::Code, &run).is_err());
        run.plan_artifact = Some(PlanArtifact::default());
        assert!(check_phase_guard(Phase::Code, &run).is_ok());
    }

    #[test]
    fn test_plan_guard_rejects_wrong_status() {
        let run = run_in(RunStatus::Ready);
        let err = check_phase_guard(Phase::Plan, &run).unwrap_err();
        assert!(err.contains("pending"));
    }

    #[test]
    fn test_terminal_run_refuses_every_forward_phase() {
        for status in [RunStatus::Completed, RunStatus::Failed, RunStatus::RolledBack] {
            let run = run_in(status);
            for phase in [Phase::Plan, Phase::Code, Phase::Review, Phase::Apply] {
                let err = check_phase_guard(phase, &run).unwrap_err();
                assert!(err.contains("already"), "{phase} on {status}: {err}");
            }
        }
    }

    #[test]
    fn test_plan_resume_only_without_stored_plan() {
        let mut run = run_in(RunStatus::Planning);
        assert!(check_phase_guard(Phase::Plan, &run).is_ok());
        run.plan_artifact = Some(PlanArtifact::default());
        assert!(check_phase_guard(Phase::Plan, &run).is_err());
    }

    #[test]
    fn test_apply_guard_requires_approved_review() {
        let mut run = run_in(RunStatus::Ready);
        run.diff_content = Some("diff".into());
        assert!(check_phase_guard(Phase::Apply, &run).is_err());
        let mut rejected = approved();
        rejected.safe_to_apply = false;
        run.review_result = Some(rejected);
        assert!(check_phase_guard(Phase::Apply, &run).is_err());
        run.review_result = Some(approved());
        assert!(check_phase_guard(Phase::Apply, &run).is_ok());
    }

    #[test]
    fn test_apply_cannot_resume() {
        let mut run = run_in(RunStatus::Applying);
        run.diff_content = Some("diff".into());
        run.review_result = Some(approved());
        assert!(check_phase_guard(Phase::Apply, &run).is_err());
    }

    #[test]
    fn test_rollback_guard_requires_checkpoint() {
        let mut run = run_in(RunStatus::Completed);
        assert!(check_phase_guard(Phase::Rollback, &run).is_err());
        run.git_checkpoint = Some("a".repeat(40));
        assert!(check_phase_guard(Phase::Rollback, &run).is_ok());
        run.status = RunStatus::Ready;
        assert!(check_phase_guard(Phase::Rollback, &run).is_err());
    }

    #[test]
    fn test_next_phase() {
        let mut run = run_in(RunStatus::Pending);
        assert_eq!(next_phase(&run), Some(Phase::Plan));
        run.status = RunStatus::Planning;
        run.plan_artifact = Some(PlanArtifact::default());
        assert_eq!(next_phase(&run), Some(Phase::Code));
        run.status = RunStatus::Ready;
        assert_eq!(next_phase(&run), Some(Phase::Apply));
        run.status = RunStatus::Completed;
        assert_eq!(next_phase(&run), None);
    }
}
