use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::archive::{ArtifactSink, DirectorySink};
use crate::config::ScanConfig;
use crate::context::RunContext;
use crate::downstream::{DownstreamContext, DownstreamJob, DownstreamReport};
use crate::environment::{EnvHandle, Environment, EnvironmentLease, WorkspaceEnvironment};
use crate::gate::{GateController, GateDecision, GatePolicy};
use crate::output;
use crate::pipeline::Pipeline;
use crate::probe::{AvailabilityProbe, PathProbe};
use crate::profile::{self, ScanProfile, StageKind};
use crate::registry::ToolRegistry;
use crate::runner::ToolRunner;
use crate::stages::ToolStage;
use crate::summary::RunSummary;

pub const SUMMARY_FILE: &str = "scan-summary.txt";

// ─── Run state ───

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    EnvironmentReady,
    Stages,
    Aggregated,
    GateOpen,
    GateClosed,
    EnvironmentReleased,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Initialized, EnvironmentReady)
                | (Initialized, EnvironmentReleased)
                | (EnvironmentReady, Stages)
                | (EnvironmentReady, EnvironmentReleased)
                | (Stages, Aggregated)
                | (Aggregated, GateOpen)
                | (Aggregated, GateClosed)
                | (Aggregated, EnvironmentReleased)
                | (GateOpen, EnvironmentReleased)
                | (GateClosed, EnvironmentReleased)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Initialized => "initialized",
            RunState::EnvironmentReady => "environment-ready",
            RunState::Stages => "stages",
            RunState::Aggregated => "aggregated",
            RunState::GateOpen => "gate-open",
            RunState::GateClosed => "gate-closed",
            RunState::EnvironmentReleased => "environment-released",
        };
        f.write_str(name)
    }
}

struct StateTracker {
    current: RunState,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            current: RunState::Initialized,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.current.can_advance_to(next),
            "invalid run state transition {} -> {}",
            self.current,
            next
        );
        debug!(from = %self.current, to = %next, "run state");
        self.current = next;
    }
}

// ─── Requests and reports ───

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub profile: ScanProfile,
    pub target: PathBuf,
    pub run_downstream: bool,
}

/// Everything a full run produced.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub gate: GateDecision,
    /// Where the text summary was written, if writing succeeded.
    pub summary_path: Option<PathBuf>,
    pub downstream: Option<DownstreamReport>,
    pub downstream_error: Option<String>,
    pub archived: Vec<PathBuf>,
}

// ─── Orchestrator ───

/// Drives one scan: environment setup, the three tool stages in fixed order,
/// aggregation, the gate, the optional downstream job and archival.
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    environment: Arc<dyn Environment>,
    probe: Option<Arc<dyn AvailabilityProbe>>,
    policy: GatePolicy,
    artifact_dir: PathBuf,
    default_timeout: Duration,
    static_budget: Option<Duration>,
    manifest: Option<PathBuf>,
    install_tools: bool,
    sink: Option<Arc<dyn ArtifactSink>>,
    archive_patterns: Vec<String>,
    downstream: Option<Arc<dyn DownstreamJob>>,
}

impl Orchestrator {
    pub fn builder(
        environment: Arc<dyn Environment>,
        artifact_dir: impl Into<PathBuf>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            inner: Orchestrator {
                registry: Arc::new(ToolRegistry::catalog()),
                environment,
                probe: None,
                policy: GatePolicy::default(),
                artifact_dir: artifact_dir.into(),
                default_timeout: Duration::from_secs(300),
                static_budget: None,
                manifest: None,
                install_tools: false,
                sink: None,
                archive_patterns: vec![],
                downstream: None,
            },
        }
    }

    /// The production wiring: catalog tools, a workspace environment inside
    /// the artifact directory and whatever optional collaborators `config`
    /// enables.
    pub fn from_config(config: &ScanConfig) -> Self {
        let mut env = WorkspaceEnvironment::new(&config.artifact_dir);
        if let Some(python) = &config.python {
            env = env.with_python(python);
        }

        let mut builder = Self::builder(Arc::new(env), &config.artifact_dir)
            .policy(config.policy())
            .default_timeout(config.default_timeout())
            .static_budget(config.static_stage_budget())
            .install_tools(config.install_tools);
        if let Some(manifest) = &config.manifest {
            builder = builder.manifest(manifest);
        }
        if let Some(dest) = &config.archive_dir {
            builder = builder.archive(
                Arc::new(DirectorySink::new(dest)),
                config.archive_patterns.clone(),
            );
        }
        if let Some(job) = config.downstream_job() {
            builder = builder.downstream(Arc::new(job));
        }
        builder.build()
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Runs every stage of `profile` against `target`. Only an environment
    /// setup failure is an error; tool failures are recorded in the summary.
    pub async fn execute(&self, profile: ScanProfile, target: &Path) -> Result<RunSummary> {
        let mut state = StateTracker::new();
        let lease = self.prepare(profile, target, &mut state).await?;
        let summary = self.scan(lease.handle(), profile, target, &mut state).await;
        lease.release();
        state.advance(RunState::EnvironmentReleased);
        Ok(summary)
    }

    /// `execute` followed by the summary file, the gate, the downstream job
    /// and archival.
    #[instrument(skip_all, fields(profile = %request.profile, target = %request.target.display()))]
    pub async fn run(&self, request: &RunRequest) -> Result<RunReport> {
        let mut state = StateTracker::new();
        let lease = self.prepare(request.profile, &request.target, &mut state).await?;
        let summary = self
            .scan(lease.handle(), request.profile, &request.target, &mut state)
            .await;

        let summary_path = self.write_summary_file(&summary).await;

        let gate = GateController::decide(&summary, request.run_downstream);
        state.advance(if gate.is_open() {
            RunState::GateOpen
        } else {
            RunState::GateClosed
        });

        let (downstream, downstream_error) = if gate.is_open() {
            self.run_downstream(lease.handle(), &request.target).await
        } else {
            (None, None)
        };

        let archived = self.archive().await;

        lease.release();
        state.advance(RunState::EnvironmentReleased);

        Ok(RunReport {
            summary,
            gate,
            summary_path,
            downstream,
            downstream_error,
            archived,
        })
    }

    /// Creates the artifact directory and acquires the environment. Any
    /// failure here is fatal for the run; a lease acquired before the failure
    /// is released when dropped.
    async fn prepare(
        &self,
        profile: ScanProfile,
        target: &Path,
        state: &mut StateTracker,
    ) -> Result<EnvironmentLease> {
        if !target.exists() {
            bail!("scan target {} does not exist", target.display());
        }
        tokio::fs::create_dir_all(&self.artifact_dir)
            .await
            .with_context(|| {
                format!("failed to create artifact directory {}", self.artifact_dir.display())
            })?;

        let lease = EnvironmentLease::acquire(self.environment.clone())
            .await
            .context("environment setup failed")?;

        if let Some(manifest) = &self.manifest {
            lease
                .environment()
                .install_dependencies(lease.handle(), manifest)
                .await
                .context("environment setup failed")?;
        }

        if self.install_tools {
            self.install_stage_tools(&lease, profile).await;
        }

        state.advance(RunState::EnvironmentReady);
        Ok(lease)
    }

    async fn install_stage_tools(&self, lease: &EnvironmentLease, profile: ScanProfile) {
        for stage in profile::active_stages(profile) {
            let mode = profile::speed_mode(profile, stage);
            for tool in self.registry.tools_for(stage, mode) {
                let Some(recipe) = &tool.install else { continue };
                if let Err(e) = lease.environment().install_tool(lease.handle(), recipe).await {
                    warn!(
                        tool = %tool.id,
                        error = %format!("{e:#}"),
                        "tool installation failed, continuing"
                    );
                }
            }
        }
    }

    fn runner(&self, handle: &EnvHandle) -> ToolRunner {
        let search_path = handle.search_path();
        let probe: Arc<dyn AvailabilityProbe> = match (&self.probe, &search_path) {
            (Some(probe), _) => probe.clone(),
            (None, Some(path)) => Arc::new(PathProbe::with_search_path(path.clone())),
            (None, None) => Arc::new(PathProbe::new()),
        };

        let mut runner =
            ToolRunner::new(probe, &self.artifact_dir).default_timeout(self.default_timeout);
        if let Some(path) = search_path {
            runner = runner.env("PATH", path.to_string_lossy());
        }
        runner
    }

    fn pipeline(&self) -> Pipeline {
        let mut builder = Pipeline::builder();
        for kind in StageKind::ORDERED {
            let mut stage = ToolStage::new(kind, self.registry.clone());
            if kind == StageKind::StaticSecurity
                && let Some(budget) = self.static_budget
            {
                stage = stage.budget(budget);
            }
            builder = builder.stage(stage);
        }
        builder.build()
    }

    async fn scan(
        &self,
        handle: &EnvHandle,
        profile: ScanProfile,
        target: &Path,
        state: &mut StateTracker,
    ) -> RunSummary {
        let mut ctx = RunContext::new(
            profile,
            target.to_path_buf(),
            self.runner(handle),
            RunSummary::builder(profile, Utc::now()),
        );
        info!(run_id = %ctx.run_id(), %profile, "scan started");

        state.advance(RunState::Stages);
        self.pipeline().run(&mut ctx).await;

        let summary = ctx.finish(&self.policy);
        state.advance(RunState::Aggregated);
        info!(
            run_id = %summary.run_id(),
            status = %summary.overall_status(),
            tools = summary.outcomes().count(),
            "scan finished"
        );
        summary
    }

    async fn write_summary_file(&self, summary: &RunSummary) -> Option<PathBuf> {
        let path = self.artifact_dir.join(SUMMARY_FILE);
        match tokio::fs::write(&path, output::summarize(summary)).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write summary file");
                None
            }
        }
    }

    async fn run_downstream(
        &self,
        handle: &EnvHandle,
        target: &Path,
    ) -> (Option<DownstreamReport>, Option<String>) {
        let Some(job) = &self.downstream else {
            warn!("downstream job requested but none is configured");
            return (None, None);
        };
        let ctx = DownstreamContext {
            target: target.to_path_buf(),
            artifact_dir: self.artifact_dir.clone(),
            search_path: handle.search_path(),
        };
        match job.run(&ctx).await {
            Ok(report) => (Some(report), None),
            Err(e) => {
                warn!(job = job.name(), error = %format!("{e:#}"), "downstream job failed");
                (None, Some(format!("{e:#}")))
            }
        }
    }

    async fn archive(&self) -> Vec<PathBuf> {
        let Some(sink) = &self.sink else {
            return vec![];
        };
        match sink.archive(&self.artifact_dir, &self.archive_patterns).await {
            Ok(archived) => archived,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "archival failed");
                vec![]
            }
        }
    }
}

pub struct OrchestratorBuilder {
    inner: Orchestrator,
}

impl OrchestratorBuilder {
    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.inner.registry = Arc::new(registry);
        self
    }

    /// Overrides the `PATH` based availability check.
    pub fn probe(mut self, probe: Arc<dyn AvailabilityProbe>) -> Self {
        self.inner.probe = Some(probe);
        self
    }

    pub fn policy(mut self, policy: GatePolicy) -> Self {
        self.inner.policy = policy;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.inner.default_timeout = timeout;
        self
    }

    pub fn static_budget(mut self, budget: Duration) -> Self {
        self.inner.static_budget = Some(budget);
        self
    }

    pub fn manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.inner.manifest = Some(manifest.into());
        self
    }

    pub fn install_tools(mut self, enabled: bool) -> Self {
        self.inner.install_tools = enabled;
        self
    }

    pub fn archive(mut self, sink: Arc<dyn ArtifactSink>, patterns: Vec<String>) -> Self {
        self.inner.sink = Some(sink);
        self.inner.archive_patterns = patterns;
        self
    }

    pub fn downstream(mut self, job: Arc<dyn DownstreamJob>) -> Self {
        self.inner.downstream = Some(job);
        self
    }

    pub fn build(self) -> Orchestrator {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::registry::{InstallRecipe, ToolSpec};
    use crate::runner::OutcomeStatus;
    use crate::summary::OverallStatus;

    // ─── Stubs ───

    #[derive(Default)]
    struct RecordingEnv {
        log: Mutex<Vec<String>>,
        fail_create: bool,
        fail_install: bool,
    }

    impl RecordingEnv {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Environment for RecordingEnv {
        async fn create(&self) -> Result<EnvHandle> {
            if self.fail_create {
                bail!("no interpreter");
            }
            self.log.lock().unwrap().push("create".into());
            Ok(EnvHandle {
                root: PathBuf::from("/nonexistent/env"),
                bin_dir: None,
            })
        }

        async fn install_dependencies(&self, _handle: &EnvHandle, manifest: &Path) -> Result<()> {
            self.log.lock().unwrap().push(format!("deps {}", manifest.display()));
            if self.fail_install {
                bail!("resolver conflict");
            }
            Ok(())
        }

        async fn install_tool(&self, _handle: &EnvHandle, recipe: &InstallRecipe) -> Result<()> {
            self.log.lock().unwrap().push(format!("tool {recipe}"));
            bail!("index unreachable")
        }

        fn destroy(&self, _handle: EnvHandle) {
            self.log.lock().unwrap().push("destroy".into());
        }
    }

    /// Everything is available except the listed tools.
    struct StubProbe {
        missing: BTreeSet<&'static str>,
    }

    impl StubProbe {
        fn all() -> Arc<Self> {
            Arc::new(Self { missing: BTreeSet::new() })
        }

        fn without(ids: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                missing: ids.iter().copied().collect(),
            })
        }
    }

    impl AvailabilityProbe for StubProbe {
        fn is_available(&self, tool: &ToolSpec) -> bool {
            !self.missing.contains(tool.id.as_str())
        }
    }

    #[derive(Default)]
    struct RecordingJob {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl DownstreamJob for RecordingJob {
        async fn run(&self, ctx: &DownstreamContext) -> Result<DownstreamReport> {
            *self.calls.lock().unwrap() += 1;
            let out = ctx.artifact_dir.join("PY_jobs-2026-10-18T08-00-00.json");
            std::fs::write(&out, "[]")?;
            Ok(DownstreamReport {
                job: "scrape".into(),
                success: true,
                exit_code: Some(0),
                collected: vec![out],
            })
        }

        fn name(&self) -> &str {
            "scrape"
        }
    }

    fn sh_tool(id: &str, stage: StageKind, script: &str) -> ToolSpec {
        ToolSpec::new(id, stage, "sh").args(["-c", script])
    }

    /// The catalog's shape with `sh` scripts standing in for the real tools.
    fn stub_registry(bandit_script: &str) -> ToolRegistry {
        ToolRegistry::new(vec![
            sh_tool("pip-audit", StageKind::DependencyVulnerability, "echo 'vuln found'; exit 1"),
            sh_tool("safety", StageKind::DependencyVulnerability, "exit 0").full_only(),
            sh_tool("bandit", StageKind::StaticSecurity, bandit_script)
                .timeout(Duration::from_millis(300)),
            sh_tool("semgrep", StageKind::StaticSecurity, "exit 0").full_only(),
            sh_tool("flake8", StageKind::CodeQuality, "exit 0"),
        ])
    }

    fn orchestrator(
        env: Arc<RecordingEnv>,
        dir: &Path,
        registry: ToolRegistry,
        probe: Arc<StubProbe>,
    ) -> OrchestratorBuilder {
        Orchestrator::builder(env, dir.join("artifacts"))
            .registry(registry)
            .probe(probe)
    }

    fn statuses(summary: &RunSummary, kind: StageKind) -> Vec<(String, OutcomeStatus)> {
        summary
            .stage(kind)
            .unwrap()
            .outcomes
            .iter()
            .map(|o| (o.tool_id.clone(), o.status))
            .collect()
    }

    // ─── Scenarios ───

    #[tokio::test]
    async fn quick_scan_with_findings_is_success_with_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(RecordingEnv::default());
        let orch = orchestrator(env.clone(), dir.path(), stub_registry("exit 0"), StubProbe::all())
            .build();

        let summary = orch.execute(ScanProfile::QuickScan, dir.path()).await.unwrap();

        assert_eq!(summary.overall_status(), OverallStatus::SuccessWithWarnings);
        assert_eq!(
            statuses(&summary, StageKind::DependencyVulnerability),
            vec![("pip-audit".to_string(), OutcomeStatus::RanWithFindings)]
        );
        assert_eq!(
            statuses(&summary, StageKind::StaticSecurity),
            vec![("bandit".to_string(), OutcomeStatus::Ran)]
        );
        let quality = summary.stage(StageKind::CodeQuality).unwrap();
        assert!(!quality.active);
        assert!(quality.outcomes.is_empty());
        assert_eq!(env.log(), vec!["create", "destroy"]);
    }

    #[tokio::test]
    async fn dependency_only_with_missing_auditor() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(RecordingEnv::default());
        let registry = ToolRegistry::new(vec![
            sh_tool("pip-audit", StageKind::DependencyVulnerability, "exit 0"),
            sh_tool("bandit", StageKind::StaticSecurity, "exit 0"),
        ]);
        let orch =
            orchestrator(env, dir.path(), registry, StubProbe::without(&["pip-audit"])).build();

        let summary = orch.execute(ScanProfile::DependencyOnly, dir.path()).await.unwrap();

        let dep = summary.stage(StageKind::DependencyVulnerability).unwrap();
        assert!(dep.active);
        assert_eq!(dep.outcomes.len(), 1);
        assert_eq!(dep.outcomes[0].status, OutcomeStatus::ToolMissing);
        assert_eq!(dep.outcomes[0].duration_ms, 0);
        assert!(!summary.stage(StageKind::StaticSecurity).unwrap().active);
        assert!(!summary.stage(StageKind::CodeQuality).unwrap().active);
        assert_eq!(summary.overall_status(), OverallStatus::SuccessWithWarnings);
    }

    #[tokio::test]
    async fn mandatory_timeout_fails_run_and_closes_gate() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(RecordingEnv::default());
        let job = Arc::new(RecordingJob::default());
        let orch = orchestrator(env.clone(), dir.path(), stub_registry("sleep 5"), StubProbe::all())
            .downstream(job.clone())
            .build();

        let report = orch
            .run(&RunRequest {
                profile: ScanProfile::AllChecks,
                target: dir.path().to_path_buf(),
                run_downstream: true,
            })
            .await
            .unwrap();

        let bandit = report.summary.outcomes().find(|o| o.tool_id == "bandit").unwrap();
        assert_eq!(bandit.status, OutcomeStatus::TimedOut);
        let flake8 = report.summary.outcomes().find(|o| o.tool_id == "flake8").unwrap();
        assert_eq!(flake8.status, OutcomeStatus::Ran);
        assert_eq!(report.summary.overall_status(), OverallStatus::Failed);
        assert!(!GateController::may_run_downstream(&report.summary, true));
        assert_eq!(report.gate, GateDecision::Closed);
        assert_eq!(*job.calls.lock().unwrap(), 0);
        assert!(report.downstream.is_none());
        assert_eq!(env.log(), vec!["create", "destroy"]);
    }

    #[tokio::test]
    async fn timeout_tolerated_when_policy_allows() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            Arc::new(RecordingEnv::default()),
            dir.path(),
            stub_registry("sleep 5"),
            StubProbe::all(),
        )
        .policy(GatePolicy::default().fail_on_mandatory_timeout(false))
        .build();

        let summary = orch.execute(ScanProfile::FullAudit, dir.path()).await.unwrap();
        assert_eq!(summary.overall_status(), OverallStatus::SuccessWithWarnings);
    }

    #[tokio::test]
    async fn open_gate_runs_downstream_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let job = Arc::new(RecordingJob::default());
        let orch = orchestrator(
            Arc::new(RecordingEnv::default()),
            dir.path(),
            stub_registry("exit 0"),
            StubProbe::all(),
        )
        .downstream(job.clone())
        .archive(Arc::new(DirectorySink::new(&archive)), vec!["*.json".into(), "*.txt".into()])
        .build();

        let report = orch
            .run(&RunRequest {
                profile: ScanProfile::QuickScan,
                target: dir.path().to_path_buf(),
                run_downstream: true,
            })
            .await
            .unwrap();

        assert_eq!(report.gate, GateDecision::Open);
        assert_eq!(*job.calls.lock().unwrap(), 1);
        assert!(report.downstream.as_ref().unwrap().success);
        assert_eq!(report.summary_path, Some(dir.path().join("artifacts").join(SUMMARY_FILE)));
        assert!(archive.join(SUMMARY_FILE).exists());
        assert!(archive.join("PY_jobs-2026-10-18T08-00-00.json").exists());
        assert!(archive.join("pip-audit.txt").exists());
    }

    #[tokio::test]
    async fn unrequested_downstream_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let job = Arc::new(RecordingJob::default());
        let orch = orchestrator(
            Arc::new(RecordingEnv::default()),
            dir.path(),
            stub_registry("exit 0"),
            StubProbe::all(),
        )
        .downstream(job.clone())
        .build();

        let report = orch
            .run(&RunRequest {
                profile: ScanProfile::QuickScan,
                target: dir.path().to_path_buf(),
                run_downstream: false,
            })
            .await
            .unwrap();

        assert_eq!(report.gate, GateDecision::NotRequested);
        assert_eq!(*job.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_run_still_archives() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let orch = orchestrator(
            Arc::new(RecordingEnv::default()),
            dir.path(),
            stub_registry("echo boom >&2; exit 7"),
            StubProbe::all(),
        )
        .archive(Arc::new(DirectorySink::new(&archive)), vec!["*.txt".into()])
        .build();

        let report = orch
            .run(&RunRequest {
                profile: ScanProfile::QuickScan,
                target: dir.path().to_path_buf(),
                run_downstream: true,
            })
            .await
            .unwrap();

        assert_eq!(report.summary.overall_status(), OverallStatus::Failed);
        assert!(archive.join(SUMMARY_FILE).exists());
        assert!(archive.join("bandit.placeholder.txt").exists());
    }

    // ─── Environment failures ───

    #[tokio::test]
    async fn environment_creation_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(RecordingEnv {
            fail_create: true,
            ..Default::default()
        });
        let orch = orchestrator(env.clone(), dir.path(), stub_registry("exit 0"), StubProbe::all())
            .build();

        let err = orch.execute(ScanProfile::QuickScan, dir.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("no interpreter"));
        assert!(!dir.path().join("artifacts/pip-audit.txt").exists());
    }

    #[tokio::test]
    async fn manifest_failure_releases_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(RecordingEnv {
            fail_install: true,
            ..Default::default()
        });
        let orch = orchestrator(env.clone(), dir.path(), stub_registry("exit 0"), StubProbe::all())
            .manifest("requirements.txt")
            .build();

        let err = orch.execute(ScanProfile::QuickScan, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("environment setup failed"));
        assert_eq!(env.log(), vec!["create", "deps requirements.txt", "destroy"]);
        assert!(!dir.path().join("artifacts/pip-audit.txt").exists());
    }

    #[tokio::test]
    async fn tool_install_failures_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(RecordingEnv::default());
        let registry = ToolRegistry::new(vec![
            sh_tool("pip-audit", StageKind::DependencyVulnerability, "exit 0")
                .install(InstallRecipe::pip("pip-audit")),
        ]);
        let orch = orchestrator(env.clone(), dir.path(), registry, StubProbe::all())
            .install_tools(true)
            .build();

        let summary = orch.execute(ScanProfile::DependencyOnly, dir.path()).await.unwrap();
        assert_eq!(summary.overall_status(), OverallStatus::Success);
        assert_eq!(env.log(), vec!["create", "tool pip install pip-audit", "destroy"]);
    }

    #[tokio::test]
    async fn missing_target_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let env = Arc::new(RecordingEnv::default());
        let orch = orchestrator(env.clone(), dir.path(), stub_registry("exit 0"), StubProbe::all())
            .build();

        let err = orch
            .execute(ScanProfile::QuickScan, &dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(env.log().is_empty());
    }

    // ─── Wiring ───

    #[test]
    fn from_config_applies_policy() {
        let config: ScanConfig = "mandatory_tools: [semgrep]\nfail_on_mandatory_timeout: false"
            .parse()
            .unwrap();
        let orch = Orchestrator::from_config(&config);
        assert!(orch.policy().is_mandatory("semgrep"));
        assert!(!orch.policy().is_mandatory("bandit"));
        assert_eq!(orch.artifact_dir(), Path::new("scan-artifacts"));
    }

    #[test]
    fn pipeline_runs_stages_in_fixed_order() {
        let orch = Orchestrator::builder(Arc::new(RecordingEnv::default()), "out").build();
        assert_eq!(
            orch.pipeline().stage_names(),
            vec!["DependencyVulnerability", "StaticSecurity", "CodeQuality"]
        );
    }

    #[test]
    fn run_state_transitions() {
        use RunState::*;
        assert!(Initialized.can_advance_to(EnvironmentReady));
        assert!(Aggregated.can_advance_to(GateOpen));
        assert!(GateClosed.can_advance_to(EnvironmentReleased));
        assert!(!Initialized.can_advance_to(Stages));
        assert!(!GateOpen.can_advance_to(Stages));
        assert!(!EnvironmentReleased.can_advance_to(Initialized));
    }
}
