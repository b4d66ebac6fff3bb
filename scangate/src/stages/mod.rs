pub mod tool_stage;

use async_trait::async_trait;

use crate::context::RunContext;

#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, ctx: &mut RunContext) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

pub use tool_stage::ToolStage;
