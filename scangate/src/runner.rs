use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::probe::AvailabilityProbe;
use crate::profile::SpeedMode;
use crate::registry::{ExitClass, OutputFormat, ReportCapture, ToolSpec};

const STDERR_DETAIL_LIMIT: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Ran,
    RanWithFindings,
    ToolMissing,
    TimedOut,
    Crashed,
}

impl OutcomeStatus {
    /// Anything but a clean run is surfaced as a warning in the summary.
    pub fn is_warning(&self) -> bool {
        !matches!(self, OutcomeStatus::Ran)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Ran => write!(f, "ran"),
            OutcomeStatus::RanWithFindings => write!(f, "ran-with-findings"),
            OutcomeStatus::ToolMissing => write!(f, "tool-missing"),
            OutcomeStatus::TimedOut => write!(f, "timed-out"),
            OutcomeStatus::Crashed => write!(f, "crashed"),
        }
    }
}

/// A file left behind by a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum Artifact {
    /// Output produced by the tool itself.
    Report(PathBuf),
    /// Marker written by the runner when the tool produced nothing usable.
    Placeholder(PathBuf),
}

impl Artifact {
    pub fn path(&self) -> &Path {
        match self {
            Artifact::Report(p) | Artifact::Placeholder(p) => p,
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Report(p) => write!(f, "{}", p.display()),
            Artifact::Placeholder(p) => write!(f, "{} (placeholder)", p.display()),
        }
    }
}

/// The classified result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutcome {
    pub tool_id: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub(crate) enum Exit {
    Finished {
        code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    TimedOut,
    SpawnFailed(std::io::Error),
    WaitFailed(std::io::Error),
}

/// Executes single tools with a bounded timeout. `run` never fails: every
/// failure mode is folded into the returned [`ToolOutcome`].
#[derive(Clone)]
pub struct ToolRunner {
    probe: Arc<dyn AvailabilityProbe>,
    artifact_dir: PathBuf,
    default_timeout: Duration,
    envs: Vec<(String, String)>,
}

impl ToolRunner {
    pub fn new(probe: Arc<dyn AvailabilityProbe>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            probe,
            artifact_dir: artifact_dir.into(),
            default_timeout: Duration::from_secs(300),
            envs: vec![],
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Extra environment variables for every spawned tool.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn probe(&self) -> &dyn AvailabilityProbe {
        self.probe.as_ref()
    }

    /// The tool's own cap, or the stage-level default.
    pub fn timeout_for(&self, tool: &ToolSpec) -> Duration {
        tool.timeout.unwrap_or(self.default_timeout)
    }

    pub async fn run(&self, tool: &ToolSpec, target: &Path, mode: SpeedMode) -> ToolOutcome {
        self.run_with_timeout(tool, target, mode, self.timeout_for(tool)).await
    }

    #[instrument(
        skip_all,
        fields(tool = %tool.id, mode = %mode, timeout_ms = limit.as_millis() as u64)
    )]
    pub async fn run_with_timeout(
        &self,
        tool: &ToolSpec,
        target: &Path,
        mode: SpeedMode,
        limit: Duration,
    ) -> ToolOutcome {
        if !self.probe.is_available(tool) {
            return self.missing(tool).await;
        }

        let report = self.artifact_dir.join(tool.report_file_name());
        if let Err(e) = tokio::fs::remove_file(&report).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(tool = %tool.id, error = %e, "failed to clear stale report");
        }

        let args = tool.render_args(target, &report, mode);
        debug!(tool = %tool.id, program = %tool.program, ?args, "spawning tool");

        let mut cmd = Command::new(&tool.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if target.is_dir() {
            cmd.current_dir(target);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let exit = execute(cmd, limit).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match exit {
            Exit::Finished { code, stdout, stderr } => {
                self.classify_finished(tool, &report, code, stdout, stderr, duration_ms).await
            }
            Exit::TimedOut => {
                let secs = limit.as_secs_f64();
                warn!(
                    tool = %tool.id,
                    limit_ms = limit.as_millis() as u64,
                    "tool timed out, process killed"
                );
                let detail = format!("killed after {secs}s");
                let note =
                    format!("{} exceeded its {secs}s timeout and was terminated.\n", tool.id);
                ToolOutcome {
                    tool_id: tool.id.clone(),
                    status: OutcomeStatus::TimedOut,
                    artifact: self.write_placeholder(tool, &note).await,
                    duration_ms,
                    exit_code: None,
                    detail: Some(detail),
                }
            }
            Exit::SpawnFailed(e) | Exit::WaitFailed(e) => {
                warn!(tool = %tool.id, error = %e, "tool could not be executed");
                let note = format!("{} could not be executed: {e}\n", tool.id);
                ToolOutcome {
                    tool_id: tool.id.clone(),
                    status: OutcomeStatus::Crashed,
                    artifact: self.write_placeholder(tool, &note).await,
                    duration_ms,
                    exit_code: None,
                    detail: Some(e.to_string()),
                }
            }
        };

        info!(tool = %outcome.tool_id, status = %outcome.status, duration_ms, "tool finished");
        outcome
    }

    /// Outcome for a tool whose stage ran out of time before its turn. The
    /// tool is never spawned.
    pub async fn budget_exhausted(&self, tool: &ToolSpec) -> ToolOutcome {
        if !self.probe.is_available(tool) {
            return self.missing(tool).await;
        }
        warn!(tool = %tool.id, "stage time budget exhausted, tool skipped");
        let note = format!("{} was not started: the stage time budget was exhausted.\n", tool.id);
        ToolOutcome {
            tool_id: tool.id.clone(),
            status: OutcomeStatus::TimedOut,
            artifact: self.write_placeholder(tool, &note).await,
            duration_ms: 0,
            exit_code: None,
            detail: Some("stage budget exhausted".to_string()),
        }
    }

    async fn missing(&self, tool: &ToolSpec) -> ToolOutcome {
        info!(tool = %tool.id, "tool unavailable, writing placeholder");
        let note = format!(
            "{} is not available in this environment; no scan was performed.\n",
            tool.id
        );
        ToolOutcome {
            tool_id: tool.id.clone(),
            status: OutcomeStatus::ToolMissing,
            artifact: self.write_placeholder(tool, &note).await,
            duration_ms: 0,
            exit_code: None,
            detail: Some("not installed".to_string()),
        }
    }

    async fn classify_finished(
        &self,
        tool: &ToolSpec,
        report: &Path,
        code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        duration_ms: u64,
    ) -> ToolOutcome {
        let class = match code {
            Some(c) => tool.exit.classify(c),
            // Terminated by a signal.
            None => ExitClass::Error,
        };

        let status = match class {
            ExitClass::Clean => OutcomeStatus::Ran,
            ExitClass::Findings => OutcomeStatus::RanWithFindings,
            ExitClass::Error => OutcomeStatus::Crashed,
        };

        if status == OutcomeStatus::Crashed {
            let stderr_text = String::from_utf8_lossy(&stderr);
            let tail = tail(stderr_text.trim(), STDERR_DETAIL_LIMIT);
            let detail = match code {
                Some(c) => format!("exit code {c}"),
                None => "terminated by signal".to_string(),
            };
            let note = format!("{} failed ({detail}).\n{tail}\n", tool.id);
            return ToolOutcome {
                tool_id: tool.id.clone(),
                status,
                artifact: self.write_placeholder(tool, &note).await,
                duration_ms,
                exit_code: code,
                detail: Some(detail),
            };
        }

        ToolOutcome {
            tool_id: tool.id.clone(),
            status,
            artifact: self.capture_report(tool, report, &stdout).await,
            duration_ms,
            exit_code: code,
            detail: None,
        }
    }

    async fn capture_report(
        &self,
        tool: &ToolSpec,
        report: &Path,
        stdout: &[u8],
    ) -> Option<Artifact> {
        if tool.capture == ReportCapture::File
            && tokio::fs::try_exists(report).await.unwrap_or(false)
        {
            return Some(Artifact::Report(report.to_path_buf()));
        }

        if tool.capture == ReportCapture::File {
            debug!(tool = %tool.id, "tool wrote no report file, keeping stdout instead");
        }
        if tool.output_format == OutputFormat::Json
            && serde_json::from_slice::<serde_json::Value>(stdout).is_err()
        {
            debug!(tool = %tool.id, "report is not valid JSON, keeping raw output");
        }

        match tokio::fs::write(report, stdout).await {
            Ok(()) => Some(Artifact::Report(report.to_path_buf())),
            Err(e) => {
                warn!(
                    tool = %tool.id,
                    path = %report.display(),
                    error = %e,
                    "failed to write report"
                );
                None
            }
        }
    }

    async fn write_placeholder(&self, tool: &ToolSpec, note: &str) -> Option<Artifact> {
        let path = self.artifact_dir.join(format!("{}.placeholder.txt", tool.id));
        match tokio::fs::write(&path, note).await {
            Ok(()) => Some(Artifact::Placeholder(path)),
            Err(e) => {
                warn!(
                    tool = %tool.id,
                    path = %path.display(),
                    error = %e,
                    "failed to write placeholder"
                );
                None
            }
        }
    }
}

/// Spawns `cmd` and waits for it to exit and close both output pipes, all
/// within `limit`. Background processes holding the pipes open count against
/// the same deadline.
pub(crate) async fn execute(mut cmd: Command, limit: Duration) -> Exit {
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return Exit::SpawnFailed(e),
    };
    // `id()` is gone once the child is reaped, but its group may live on.
    let pid = child.id();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let finished = tokio::time::timeout(limit, async {
        let (status, stdout, stderr) = tokio::join!(
            child.wait(),
            read_all(stdout.as_mut()),
            read_all(stderr.as_mut())
        );
        status.map(|status| (status, stdout, stderr))
    })
    .await;

    match finished {
        Ok(Ok((status, stdout, stderr))) => Exit::Finished {
            code: status.code(),
            stdout,
            stderr,
        },
        Ok(Err(e)) => Exit::WaitFailed(e),
        Err(_) => {
            terminate(&mut child, pid).await;
            Exit::TimedOut
        }
    }
}

/// Kills the process group led by `pid`, then the child itself, and reaps it.
pub(crate) async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The child leads its own process group.
        // SAFETY: kill(2) with a negative pid only signals that group.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after timeout");
    }
}

async fn read_all<R>(pipe: Option<&mut R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
