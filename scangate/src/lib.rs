pub mod archive;
pub mod config;
pub mod context;
pub mod downstream;
pub mod environment;
pub mod gate;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod probe;
pub mod profile;
pub mod registry;
pub mod runner;
pub mod stages;
pub mod summary;
#[cfg(all(test, target_os = "linux"))]
mod testing;

pub use config::ScanConfig;
pub use gate::{GateController, GateDecision, GatePolicy};
pub use orchestrator::{Orchestrator, RunReport, RunRequest, RunState};
pub use profile::{ScanProfile, SpeedMode, StageKind};
pub use runner::{OutcomeStatus, ToolOutcome, ToolRunner};
pub use summary::{OverallStatus, RunSummary, StageResult};
