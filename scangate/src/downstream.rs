use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::archive::matching_files;
use crate::runner::{Exit, execute};

/// Where a downstream job runs and where its output should end up.
#[derive(Debug, Clone)]
pub struct DownstreamContext {
    pub target: PathBuf,
    pub artifact_dir: PathBuf,
    pub search_path: Option<OsString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownstreamReport {
    pub job: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Output files copied into the artifact directory.
    pub collected: Vec<PathBuf>,
}

/// The optional job triggered after the scan gate opens.
#[async_trait]
pub trait DownstreamJob: Send + Sync {
    async fn run(&self, ctx: &DownstreamContext) -> Result<DownstreamReport>;
    fn name(&self) -> &str;
}

/// Runs an external command (the data scraper) and collects the dated data
/// files it leaves in its working directory.
#[derive(Debug, Clone)]
pub struct CommandJob {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    output_pattern: String,
    timeout: Duration,
}

impl CommandJob {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            output_pattern: "PY_jobs-*.json".to_string(),
            timeout: Duration::from_secs(1800),
        }
    }

    /// Defaults to the scan target.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn output_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.output_pattern = pattern.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn collect_outputs(
        &self,
        dir: &Path,
        since: SystemTime,
        artifact_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let fresh: Vec<PathBuf> =
            matching_files(dir, std::slice::from_ref(&self.output_pattern))?
                .into_iter()
                .filter(|p| {
                    std::fs::metadata(p)
                        .and_then(|m| m.modified())
                        .is_ok_and(|modified| modified >= since)
                })
                .collect();

        let mut collected = Vec::with_capacity(fresh.len());
        for file in fresh {
            let Some(name) = file.file_name() else { continue };
            let dest = artifact_dir.join(name);
            // Copying a file onto itself truncates it.
            if same_file(&file, &dest) {
                collected.push(dest);
                continue;
            }
            tokio::fs::copy(&file, &dest)
                .await
                .with_context(|| format!("failed to copy {} into artifacts", file.display()))?;
            collected.push(dest);
        }
        Ok(collected)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[async_trait]
impl DownstreamJob for CommandJob {
    #[instrument(skip_all, fields(job = %self.program))]
    async fn run(&self, ctx: &DownstreamContext) -> Result<DownstreamReport> {
        let dir = self.working_dir.clone().unwrap_or_else(|| ctx.target.clone());
        // Coarse filesystem timestamps can lag the wall clock slightly.
        let since = SystemTime::now() - Duration::from_secs(1);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &ctx.search_path {
            cmd.env("PATH", path);
        }
        // Browsers and drivers started by the job share its group.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(program = %self.program, dir = %dir.display(), "starting downstream job");
        let (code, stderr) = match execute(cmd, self.timeout).await {
            Exit::Finished { code, stderr, .. } => (code, stderr),
            Exit::TimedOut => bail!(
                "{} did not finish within {}s",
                self.program,
                self.timeout.as_secs()
            ),
            Exit::SpawnFailed(e) => {
                return Err(e).with_context(|| format!("failed to start {}", self.program));
            }
            Exit::WaitFailed(e) => {
                return Err(e).with_context(|| format!("failed to wait for {}", self.program));
            }
        };

        let success = code == Some(0);
        if !success {
            let stderr = String::from_utf8_lossy(&stderr);
            warn!(?code, stderr = %stderr.trim(), "downstream job failed");
        }

        let collected = self.collect_outputs(&dir, since, &ctx.artifact_dir).await?;
        if collected.is_empty() {
            warn!(
                pattern = %self.output_pattern,
                dir = %dir.display(),
                "downstream job produced no output file"
            );
        } else {
            info!(count = collected.len(), "downstream output collected");
        }

        Ok(DownstreamReport {
            job: self.name().to_string(),
            success,
            exit_code: code,
            collected,
        })
    }

    fn name(&self) -> &str {
        &self.program
    }
}
