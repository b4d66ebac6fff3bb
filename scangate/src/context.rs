use std::path::PathBuf;

use serde::Serialize;

use crate::gate::GatePolicy;
use crate::profile::ScanProfile;
use crate::runner::ToolRunner;
use crate::summary::{RunSummary, RunSummaryBuilder, StageResult};

/// Mutable state threaded through the stages of one run.
pub struct RunContext {
    pub profile: ScanProfile,
    pub target: PathBuf,
    pub runner: ToolRunner,
    summary: RunSummaryBuilder,
}

impl RunContext {
    pub fn new(
        profile: ScanProfile,
        target: PathBuf,
        runner: ToolRunner,
        summary: RunSummaryBuilder,
    ) -> Self {
        Self {
            profile,
            target,
            runner,
            summary,
        }
    }

    pub fn run_id(&self) -> &str {
        self.summary.run_id()
    }

    pub fn record_stage(&mut self, result: StageResult) {
        self.summary.push_stage(result);
    }

    pub fn record_error(&mut self, stage: &str, error: &anyhow::Error) {
        self.summary.push_error(StageError {
            stage: stage.to_string(),
            message: format!("{error:#}"),
        });
    }

    pub fn finish(self, policy: &GatePolicy) -> RunSummary {
        self.summary.finish(policy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageError {
    pub stage: String,
    pub message: String,
}
