use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::StageError;
use crate::gate::GatePolicy;
use crate::profile::{ScanProfile, StageKind};
use crate::runner::{OutcomeStatus, ToolOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverallStatus {
    Success,
    SuccessWithWarnings,
    Failed,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Success => write!(f, "success"),
            OverallStatus::SuccessWithWarnings => write!(f, "success-with-warnings"),
            OverallStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub active: bool,
    pub outcomes: Vec<ToolOutcome>,
}

impl StageResult {
    pub fn inactive(stage: StageKind) -> Self {
        Self {
            stage,
            active: false,
            outcomes: vec![],
        }
    }

    pub fn active(stage: StageKind, outcomes: Vec<ToolOutcome>) -> Self {
        Self {
            stage,
            active: true,
            outcomes,
        }
    }
}

/// The frozen result of a run. Built through [`RunSummaryBuilder`]; no
/// mutating access once finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    run_id: String,
    profile: ScanProfile,
    started_at: DateTime<Utc>,
    stage_results: Vec<StageResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<StageError>,
    overall_status: OverallStatus,
}

impl RunSummary {
    pub fn builder(profile: ScanProfile, started_at: DateTime<Utc>) -> RunSummaryBuilder {
        RunSummaryBuilder {
            run_id: run_id_for(started_at),
            profile,
            started_at,
            stage_results: vec![],
            errors: vec![],
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn profile(&self) -> ScanProfile {
        self.profile
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stage_results(&self) -> &[StageResult] {
        &self.stage_results
    }

    /// Faults raised by stages themselves, as opposed to tool outcomes.
    pub fn errors(&self) -> &[StageError] {
        &self.errors
    }

    pub fn overall_status(&self) -> OverallStatus {
        self.overall_status
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stage_results.iter().find(|s| s.stage == kind)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &ToolOutcome> {
        self.stage_results.iter().flat_map(|s| s.outcomes.iter())
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes().filter(|o| o.status == status).count()
    }
}

pub struct RunSummaryBuilder {
    run_id: String,
    profile: ScanProfile,
    started_at: DateTime<Utc>,
    stage_results: Vec<StageResult>,
    errors: Vec<StageError>,
}

impl RunSummaryBuilder {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn push_stage(&mut self, result: StageResult) {
        self.stage_results.push(result);
    }

    pub fn push_error(&mut self, error: StageError) {
        self.errors.push(error);
    }

    pub fn finish(self, policy: &GatePolicy) -> RunSummary {
        let overall_status = policy.overall_status(&self.stage_results);
        RunSummary {
            run_id: self.run_id,
            profile: self.profile,
            started_at: self.started_at,
            stage_results: self.stage_results,
            errors: self.errors,
            overall_status,
        }
    }
}

fn run_id_for(started_at: DateTime<Utc>) -> String {
    format!("scan-{}", started_at.format("%Y%m%dT%H%M%SZ"))
}
