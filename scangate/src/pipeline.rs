use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::context::RunContext;
use crate::stages::Stage;

/// An ordered list of stages executed one after another. A failing stage is
/// recorded and the remaining stages still run.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<Vec<Box<dyn Stage>>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder { stages: vec![] }
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id(), stage_count = self.stages.len()))]
    pub async fn run(&self, ctx: &mut RunContext) {
        for stage in self.stages.iter() {
            if let Err(e) = stage.run(ctx).await {
                warn!(
                    stage = stage.name(),
                    error = %e,
                    "stage failed"
                );
                ctx.record_error(stage.name(), &e);
            } else {
                debug!(stage = stage.name(), "stage complete");
            }
        }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: Arc::new(self.stages),
        }
    }
}
