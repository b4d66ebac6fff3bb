use std::ffi::OsString;
use std::path::PathBuf;

use tracing::debug;

use crate::registry::ToolSpec;

/// Answers whether a tool can be executed in the current environment.
///
/// Absence is an expected answer, never an error.
pub trait AvailabilityProbe: Send + Sync {
    fn is_available(&self, tool: &ToolSpec) -> bool;
}

/// Resolves a tool's program against `PATH` (or an explicit search path).
#[derive(Debug, Clone, Default)]
pub struct PathProbe {
    search_path: Option<OsString>,
}

impl PathProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe against `paths` instead of the process `PATH`, e.g. an isolated
    /// environment's `bin` directory followed by the inherited path.
    pub fn with_search_path(paths: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(paths.into()),
        }
    }

    pub fn resolve(&self, program: &str) -> Option<PathBuf> {
        let resolved = match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().ok()?;
                which::which_in(program, Some(paths), cwd)
            }
            None => which::which(program),
        };
        resolved.ok()
    }
}

impl AvailabilityProbe for PathProbe {
    fn is_available(&self, tool: &ToolSpec) -> bool {
        match self.resolve(&tool.program) {
            Some(path) => {
                debug!(tool = %tool.id, path = %path.display(), "tool resolved");
                true
            }
            None => {
                debug!(tool = %tool.id, program = %tool.program, "tool not found");
                false
            }
        }
    }
}
