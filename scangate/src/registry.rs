use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::profile::{SpeedMode, StageKind};

/// Hard cap for the pattern-matching scanner, independent of stage defaults.
pub const PATTERN_SCANNER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    PlainText,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::PlainText => "txt",
        }
    }
}

/// Where a tool's report comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportCapture {
    /// The tool writes the file itself; its args reference `{report}`.
    File,
    /// The tool prints its report; stdout is saved to the report path.
    Stdout,
}

/// How a tool's exit code separates "clean", "findings" and "internal error".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitConvention {
    /// 0 is clean, any listed code means findings, everything else is an error.
    Codes { findings: Vec<i32> },
    /// Bit-flag exit status (pylint style). Any bit in `error_mask` wins over
    /// `findings_mask`.
    Bitmask { error_mask: i32, findings_mask: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Clean,
    Findings,
    Error,
}

impl ExitConvention {
    pub fn classify(&self, code: i32) -> ExitClass {
        if code == 0 {
            return ExitClass::Clean;
        }
        match self {
            ExitConvention::Codes { findings } if findings.contains(&code) => ExitClass::Findings,
            ExitConvention::Codes { .. } => ExitClass::Error,
            ExitConvention::Bitmask { error_mask, .. } if code & error_mask != 0 => {
                ExitClass::Error
            }
            ExitConvention::Bitmask { findings_mask, .. } if code & findings_mask != 0 => {
                ExitClass::Findings
            }
            ExitConvention::Bitmask { .. } => ExitClass::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecipe {
    pub program: String,
    pub args: Vec<String>,
}

impl InstallRecipe {
    pub fn pip(package: &str) -> Self {
        Self {
            program: "pip".to_string(),
            args: vec!["install".to_string(), package.to_string()],
        }
    }
}

impl fmt::Display for InstallRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Invocation recipe for one external tool.
///
/// `args` is a template: `{target}` and `{report}` are replaced with the scan
/// target and the report path when the command is rendered. Flags from
/// `mode_args` for the active speed mode are appended after the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub id: String,
    pub stage: StageKind,
    pub program: String,
    pub args: Vec<String>,
    pub mode_args: BTreeMap<SpeedMode, Vec<String>>,
    pub output_format: OutputFormat,
    pub capture: ReportCapture,
    pub exit: ExitConvention,
    pub install: Option<InstallRecipe>,
    pub timeout: Option<Duration>,
    /// Skipped entirely in fast mode.
    pub full_only: bool,
}

impl ToolSpec {
    pub fn new(id: &str, stage: StageKind, program: &str) -> Self {
        Self {
            id: id.to_string(),
            stage,
            program: program.to_string(),
            args: vec![],
            mode_args: BTreeMap::new(),
            output_format: OutputFormat::PlainText,
            capture: ReportCapture::Stdout,
            exit: ExitConvention::Codes { findings: vec![1] },
            install: None,
            timeout: None,
            full_only: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn mode_args<I, S>(mut self, mode: SpeedMode, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mode_args.insert(mode, args.into_iter().map(Into::into).collect());
        self
    }

    pub fn format(mut self, format: OutputFormat, capture: ReportCapture) -> Self {
        self.output_format = format;
        self.capture = capture;
        self
    }

    pub fn exit_convention(mut self, exit: ExitConvention) -> Self {
        self.exit = exit;
        self
    }

    pub fn install(mut self, recipe: InstallRecipe) -> Self {
        self.install = Some(recipe);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn full_only(mut self) -> Self {
        self.full_only = true;
        self
    }

    pub fn runs_in(&self, mode: SpeedMode) -> bool {
        !(self.full_only && mode == SpeedMode::Fast)
    }

    /// File name of the report artifact, e.g. `bandit.json`.
    pub fn report_file_name(&self) -> String {
        format!("{}.{}", self.id, self.output_format.extension())
    }

    pub fn render_args(&self, target: &Path, report: &Path, mode: SpeedMode) -> Vec<String> {
        let target = target.display().to_string();
        let report = report.display().to_string();

        let mut rendered: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{target}", &target).replace("{report}", &report))
            .collect();
        if let Some(extra) = self.mode_args.get(&mode) {
            rendered.extend(extra.iter().cloned());
        }
        rendered
    }
}

/// The fixed catalog of tools, in execution order within each stage.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self { tools }
    }

    pub fn catalog() -> Self {
        use StageKind::*;

        let findings_1 = ExitConvention::Codes { findings: vec![1] };

        Self::new(vec![
            ToolSpec::new("pip-audit", DependencyVulnerability, "pip-audit")
                .args(["--format", "json", "--output", "{report}", "{target}"])
                .format(OutputFormat::Json, ReportCapture::File)
                .exit_convention(findings_1.clone())
                .install(InstallRecipe::pip("pip-audit")),
            ToolSpec::new("safety", DependencyVulnerability, "safety")
                .args(["check", "--json"])
                .format(OutputFormat::Json, ReportCapture::Stdout)
                .exit_convention(ExitConvention::Codes { findings: vec![64] })
                .install(InstallRecipe::pip("safety"))
                .full_only(),
            ToolSpec::new("bandit", StaticSecurity, "bandit")
                .args(["-r", "{target}", "-f", "json", "-o", "{report}"])
                .mode_args(SpeedMode::Fast, ["-lll"])
                .mode_args(SpeedMode::Full, ["-l"])
                .format(OutputFormat::Json, ReportCapture::File)
                .exit_convention(findings_1.clone())
                .install(InstallRecipe::pip("bandit")),
            ToolSpec::new("semgrep", StaticSecurity, "semgrep")
                .args([
                    "scan", "--config", "auto", "--json", "--error", "--output", "{report}",
                    "{target}",
                ])
                .format(OutputFormat::Json, ReportCapture::File)
                .exit_convention(findings_1.clone())
                .install(InstallRecipe::pip("semgrep"))
                .timeout(PATTERN_SCANNER_TIMEOUT)
                .full_only(),
            ToolSpec::new("flake8", CodeQuality, "flake8")
                .args(["{target}"])
                .format(OutputFormat::PlainText, ReportCapture::Stdout)
                .exit_convention(findings_1.clone())
                .install(InstallRecipe::pip("flake8")),
            ToolSpec::new("black", CodeQuality, "black")
                .args(["--check", "--diff", "{target}"])
                .format(OutputFormat::PlainText, ReportCapture::Stdout)
                .exit_convention(findings_1)
                .install(InstallRecipe::pip("black")),
            ToolSpec::new("pylint", CodeQuality, "pylint")
                .args(["--output-format=json", "--recursive=y", "{target}"])
                .format(OutputFormat::Json, ReportCapture::Stdout)
                .exit_convention(ExitConvention::Bitmask {
                    error_mask: 1 | 32,
                    findings_mask: 2 | 4 | 8 | 16,
                })
                .install(InstallRecipe::pip("pylint")),
        ])
    }

    pub fn get(&self, id: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter()
    }

    /// Tools belonging to `stage` that run in `mode`, in catalog order.
    pub fn tools_for(&self, stage: StageKind, mode: SpeedMode) -> Vec<&ToolSpec> {
        self.tools
            .iter()
            .filter(|t| t.stage == stage && t.runs_in(mode))
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::catalog()
    }
}
