use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::runner::OutcomeStatus;
use crate::summary::{OverallStatus, RunSummary, StageResult};

/// Which tools can fail a run, and how strictly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    mandatory: BTreeSet<String>,
    /// A mandatory tool that never finished counts as a crash.
    fail_on_mandatory_timeout: bool,
}

impl GatePolicy {
    pub fn new<I, S>(mandatory: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mandatory: mandatory.into_iter().map(Into::into).collect(),
            fail_on_mandatory_timeout: true,
        }
    }

    pub fn fail_on_mandatory_timeout(mut self, enabled: bool) -> Self {
        self.fail_on_mandatory_timeout = enabled;
        self
    }

    pub fn is_mandatory(&self, tool_id: &str) -> bool {
        self.mandatory.contains(tool_id)
    }

    pub fn mandatory_tools(&self) -> impl Iterator<Item = &str> {
        self.mandatory.iter().map(String::as_str)
    }

    fn is_failure(&self, tool_id: &str, status: OutcomeStatus) -> bool {
        if !self.is_mandatory(tool_id) {
            return false;
        }
        match status {
            OutcomeStatus::Crashed => true,
            OutcomeStatus::TimedOut => self.fail_on_mandatory_timeout,
            _ => false,
        }
    }

    /// `Failed` if a mandatory tool failed, `SuccessWithWarnings` if anything
    /// short of a clean run happened, else `Success`.
    pub fn overall_status(&self, stages: &[StageResult]) -> OverallStatus {
        let mut warnings = false;
        for outcome in stages.iter().flat_map(|s| s.outcomes.iter()) {
            if self.is_failure(&outcome.tool_id, outcome.status) {
                return OverallStatus::Failed;
            }
            warnings |= outcome.status.is_warning();
        }
        if warnings {
            OverallStatus::SuccessWithWarnings
        } else {
            OverallStatus::Success
        }
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self::new(["pip-audit", "bandit"])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Open,
    /// The downstream job was not requested.
    NotRequested,
    /// The scan failed.
    Closed,
}

impl GateDecision {
    pub fn is_open(&self) -> bool {
        matches!(self, GateDecision::Open)
    }
}

/// Decides whether the downstream job may run after a scan.
pub struct GateController;

impl GateController {
    pub fn decide(summary: &RunSummary, requested: bool) -> GateDecision {
        let decision = if !requested {
            GateDecision::NotRequested
        } else if summary.overall_status() == OverallStatus::Failed {
            GateDecision::Closed
        } else {
            GateDecision::Open
        };

        match decision {
            GateDecision::Closed => {
                warn!(run_id = %summary.run_id(), "scan failed, downstream job blocked")
            }
            _ => info!(run_id = %summary.run_id(), ?decision, "gate decided"),
        }
        decision
    }

    pub fn may_run_downstream(summary: &RunSummary, requested: bool) -> bool {
        Self::decide(summary, requested).is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::profile::{ScanProfile, StageKind};
    use crate::runner::ToolOutcome;

    fn outcome(id: &str, status: OutcomeStatus) -> ToolOutcome {
        ToolOutcome {
            tool_id: id.to_string(),
            status,
            artifact: None,
            duration_ms: 1,
            exit_code: None,
            detail: None,
        }
    }

    fn single(stage: StageKind, id: &str, status: OutcomeStatus) -> Vec<StageResult> {
        vec![StageResult::active(stage, vec![outcome(id, status)])]
    }

    fn summary_with(outcomes: Vec<ToolOutcome>, policy: &GatePolicy) -> RunSummary {
        let mut builder = RunSummary::builder(ScanProfile::AllChecks, Utc::now());
        builder.push_stage(StageResult::active(StageKind::StaticSecurity, outcomes));
        builder.finish(policy)
    }

    const ALL_STATUSES: [OutcomeStatus; 5] = [
        OutcomeStatus::Ran,
        OutcomeStatus::RanWithFindings,
        OutcomeStatus::ToolMissing,
        OutcomeStatus::TimedOut,
        OutcomeStatus::Crashed,
    ];

    #[test]
    fn clean_run_is_success() {
        let stages = vec![StageResult::active(
            StageKind::StaticSecurity,
            vec![outcome("bandit", OutcomeStatus::Ran), outcome("semgrep", OutcomeStatus::Ran)],
        )];
        assert_eq!(GatePolicy::default().overall_status(&stages), OverallStatus::Success);
    }

    #[test]
    fn no_outcomes_is_success() {
        assert_eq!(GatePolicy::default().overall_status(&[]), OverallStatus::Success);
    }

    #[test]
    fn warnings_never_fail() {
        for status in [OutcomeStatus::RanWithFindings, OutcomeStatus::ToolMissing] {
            let stages = single(StageKind::StaticSecurity, "bandit", status);
            assert_eq!(
                GatePolicy::default().overall_status(&stages),
                OverallStatus::SuccessWithWarnings,
                "{status}"
            );
        }
    }

    #[test]
    fn optional_crash_is_warning() {
        let stages = single(StageKind::CodeQuality, "pylint", OutcomeStatus::Crashed);
        assert_eq!(
            GatePolicy::default().overall_status(&stages),
            OverallStatus::SuccessWithWarnings
        );
    }

    #[test]
    fn mandatory_crash_fails() {
        let stages = vec![StageResult::active(
            StageKind::DependencyVulnerability,
            vec![
                outcome("pip-audit", OutcomeStatus::Crashed),
                outcome("safety", OutcomeStatus::Ran),
            ],
        )];
        assert_eq!(GatePolicy::default().overall_status(&stages), OverallStatus::Failed);
    }

    #[test]
    fn mandatory_timeout_fails_by_default() {
        let stages = single(StageKind::StaticSecurity, "bandit", OutcomeStatus::TimedOut);
        assert_eq!(GatePolicy::default().overall_status(&stages), OverallStatus::Failed);
    }

    #[test]
    fn mandatory_timeout_can_be_a_warning() {
        let policy = GatePolicy::default().fail_on_mandatory_timeout(false);
        let stages = single(StageKind::StaticSecurity, "bandit", OutcomeStatus::TimedOut);
        assert_eq!(policy.overall_status(&stages), OverallStatus::SuccessWithWarnings);
    }

    #[test]
    fn mandatory_membership_is_configurable() {
        let policy = GatePolicy::new(["pylint"]);
        assert!(policy.is_mandatory("pylint"));
        assert!(!policy.is_mandatory("bandit"));
        let stages = single(StageKind::CodeQuality, "pylint", OutcomeStatus::Crashed);
        assert_eq!(policy.overall_status(&stages), OverallStatus::Failed);
    }

    #[test]
    fn not_requested_is_always_closed() {
        let policy = GatePolicy::default();
        for status in ALL_STATUSES {
            for id in ["bandit", "flake8"] {
                let summary = summary_with(vec![outcome(id, status)], &policy);
                assert!(!GateController::may_run_downstream(&summary, false));
                assert_eq!(GateController::decide(&summary, false), GateDecision::NotRequested);
            }
        }
    }

    #[test]
    fn requested_follows_overall_status() {
        let policy = GatePolicy::default();
        for status in ALL_STATUSES {
            for id in ["bandit", "flake8"] {
                let summary = summary_with(vec![outcome(id, status)], &policy);
                let expected = summary.overall_status() != OverallStatus::Failed;
                assert_eq!(
                    GateController::may_run_downstream(&summary, true),
                    expected,
                    "{id} {status}"
                );
            }
        }
    }

    #[test]
    fn mandatory_crash_closes_gate() {
        let policy = GatePolicy::default();
        let summary = summary_with(
            vec![outcome("bandit", OutcomeStatus::Crashed), outcome("semgrep", OutcomeStatus::Ran)],
            &policy,
        );
        assert_eq!(GateController::decide(&summary, true), GateDecision::Closed);
    }
}
