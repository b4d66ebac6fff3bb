use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::downstream::CommandJob;
use crate::gate::GatePolicy;

// ─── Schema ───

/// Run configuration, typically loaded from `scangate.yml`. Every field has a
/// default so an empty document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    pub artifact_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub archive_patterns: Vec<String>,
    pub mandatory_tools: Vec<String>,
    pub fail_on_mandatory_timeout: bool,
    pub default_timeout_secs: u64,
    pub static_stage_budget_secs: u64,
    pub manifest: Option<PathBuf>,
    /// Interpreter used to create an isolated virtual environment.
    pub python: Option<String>,
    pub install_tools: bool,
    pub downstream: Option<DownstreamConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownstreamConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_output_pattern")]
    pub output_pattern: String,
    #[serde(default = "default_downstream_timeout")]
    pub timeout_secs: u64,
}

fn default_output_pattern() -> String {
    "PY_jobs-*.json".to_string()
}

fn default_downstream_timeout() -> u64 {
    1800
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("scan-artifacts"),
            archive_dir: None,
            archive_patterns: vec!["*.json".to_string(), "*.txt".to_string()],
            mandatory_tools: vec!["pip-audit".to_string(), "bandit".to_string()],
            fail_on_mandatory_timeout: true,
            default_timeout_secs: 300,
            static_stage_budget_secs: 600,
            manifest: None,
            python: None,
            install_tools: false,
            downstream: None,
        }
    }
}

// ─── Trait impls ───

impl FromStr for ScanConfig {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        // serde_yaml rejects an empty document for a struct.
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(s).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }
}

// ─── Methods ───

impl ScanConfig {
    /// Reads `path` if given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        raw.parse()
            .with_context(|| format!("failed to load config {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            bail!("default_timeout_secs must be greater than zero");
        }
        if self.static_stage_budget_secs == 0 {
            bail!("static_stage_budget_secs must be greater than zero");
        }
        for pattern in &self.archive_patterns {
            glob::Pattern::new(pattern)
                .with_context(|| format!("invalid archive pattern {pattern:?}"))?;
        }
        if let Some(downstream) = &self.downstream {
            if downstream.program.trim().is_empty() {
                bail!("downstream.program must not be empty");
            }
            glob::Pattern::new(&downstream.output_pattern).with_context(|| {
                format!("invalid downstream output pattern {:?}", downstream.output_pattern)
            })?;
        }
        Ok(())
    }

    pub fn policy(&self) -> GatePolicy {
        GatePolicy::new(&self.mandatory_tools)
            .fail_on_mandatory_timeout(self.fail_on_mandatory_timeout)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn static_stage_budget(&self) -> Duration {
        Duration::from_secs(self.static_stage_budget_secs)
    }

    pub fn downstream_job(&self) -> Option<CommandJob> {
        let cfg = self.downstream.as_ref()?;
        let mut job = CommandJob::new(&cfg.program, cfg.args.clone())
            .output_pattern(&cfg.output_pattern)
            .timeout(Duration::from_secs(cfg.timeout_secs));
        if let Some(dir) = &cfg.working_dir {
            job = job.working_dir(dir);
        }
        Some(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config: ScanConfig = "".parse().unwrap();
        assert_eq!(config, ScanConfig::default());
        let config: ScanConfig = "{}".parse().unwrap();
        assert_eq!(config, ScanConfig::default());
    }

    #[test]
    fn defaults() {
        let config = ScanConfig::default();
        assert_eq!(config.artifact_dir, PathBuf::from("scan-artifacts"));
        assert_eq!(config.archive_patterns, vec!["*.json", "*.txt"]);
        assert_eq!(config.default_timeout(), Duration::from_secs(300));
        assert_eq!(config.static_stage_budget(), Duration::from_secs(600));
        assert!(config.downstream_job().is_none());

        let policy = config.policy();
        assert!(policy.is_mandatory("pip-audit"));
        assert!(policy.is_mandatory("bandit"));
        assert!(!policy.is_mandatory("semgrep"));
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let yaml = "
artifact_dir: out
mandatory_tools: [semgrep]
fail_on_mandatory_timeout: false
downstream:
  program: python
  args: [scrape.py]
";
        let config: ScanConfig = yaml.parse().unwrap();
        assert_eq!(config.artifact_dir, PathBuf::from("out"));
        assert_eq!(config.default_timeout_secs, 300);
        assert!(!config.fail_on_mandatory_timeout);

        let policy = config.policy();
        assert!(policy.is_mandatory("semgrep"));
        assert!(!policy.is_mandatory("bandit"));

        let downstream = config.downstream.as_ref().unwrap();
        assert_eq!(downstream.output_pattern, "PY_jobs-*.json");
        assert_eq!(downstream.timeout_secs, 1800);
        assert!(config.downstream_job().is_some());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = "artefact_dir: out".parse::<ScanConfig>().unwrap_err();
        assert!(format!("{err:#}").contains("artefact_dir"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = "default_timeout_secs: 0".parse::<ScanConfig>().unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn bad_archive_pattern_is_rejected() {
        let err = "archive_patterns: ['[oops']".parse::<ScanConfig>().unwrap_err();
        assert!(err.to_string().contains("invalid archive pattern"));
    }

    #[test]
    fn load_without_path_is_default() {
        assert_eq!(ScanConfig::load(None).unwrap(), ScanConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scangate.yml");
        std::fs::write(&path, "install_tools: true\nmanifest: requirements.txt\n").unwrap();

        let config = ScanConfig::load(Some(&path)).unwrap();
        assert!(config.install_tools);
        assert_eq!(config.manifest, Some(PathBuf::from("requirements.txt")));
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = ScanConfig::load(Some(&dir.path().join("nope.yml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
