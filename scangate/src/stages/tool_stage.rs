use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::context::RunContext;
use crate::profile::{self, StageKind};
use crate::registry::ToolRegistry;
use crate::summary::StageResult;

use super::Stage;

/// Runs every catalog tool of one stage kind, one after another.
pub struct ToolStage {
    kind: StageKind,
    registry: Arc<ToolRegistry>,
    /// Wall-clock cap shared by all tools of the stage.
    budget: Option<Duration>,
}

impl ToolStage {
    pub fn new(kind: StageKind, registry: Arc<ToolRegistry>) -> Self {
        Self {
            kind,
            registry,
            budget: None,
        }
    }

    pub fn budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }
}

#[async_trait]
impl Stage for ToolStage {
    #[instrument(skip_all, fields(stage = %self.kind, profile = %ctx.profile))]
    async fn run(&self, ctx: &mut RunContext) -> anyhow::Result<()> {
        if !profile::is_active(ctx.profile, self.kind) {
            debug!(stage = %self.kind, "stage inactive for profile");
            ctx.record_stage(StageResult::inactive(self.kind));
            return Ok(());
        }

        let mode = profile::speed_mode(ctx.profile, self.kind);
        let tools = self.registry.tools_for(self.kind, mode);
        debug!(stage = %self.kind, %mode, count = tools.len(), "running stage tools");

        let deadline = self.budget.map(|b| Instant::now() + b);
        let mut outcomes = Vec::with_capacity(tools.len());

        for tool in tools {
            let limit = ctx.runner.timeout_for(tool);
            let outcome = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        ctx.runner.budget_exhausted(tool).await
                    } else {
                        ctx.runner
                            .run_with_timeout(tool, &ctx.target, mode, limit.min(remaining))
                            .await
                    }
                }
                None => ctx.runner.run_with_timeout(tool, &ctx.target, mode, limit).await,
            };
            outcomes.push(outcome);
        }

        ctx.record_stage(StageResult::active(self.kind, outcomes));
        Ok(())
    }

    fn name(&self) -> &str {
        match self.kind {
            StageKind::DependencyVulnerability => "DependencyVulnerability",
            StageKind::StaticSecurity => "StaticSecurity",
            StageKind::CodeQuality => "CodeQuality",
        }
    }
}
