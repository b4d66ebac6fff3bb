use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// The scan breadth selected for a run.
///
/// Valid inputs (case-insensitive, `-` and `_` interchangeable):
/// `quick-scan`, `full-audit`, `dependency-only`, `quality-only`, `all-checks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanProfile {
    QuickScan,
    FullAudit,
    DependencyOnly,
    QualityOnly,
    AllChecks,
}

impl ScanProfile {
    pub const ALL: [ScanProfile; 5] = [
        ScanProfile::QuickScan,
        ScanProfile::FullAudit,
        ScanProfile::DependencyOnly,
        ScanProfile::QualityOnly,
        ScanProfile::AllChecks,
    ];
}

impl fmt::Display for ScanProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanProfile::QuickScan => write!(f, "quick-scan"),
            ScanProfile::FullAudit => write!(f, "full-audit"),
            ScanProfile::DependencyOnly => write!(f, "dependency-only"),
            ScanProfile::QualityOnly => write!(f, "quality-only"),
            ScanProfile::AllChecks => write!(f, "all-checks"),
        }
    }
}

impl FromStr for ScanProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "quick-scan" | "quick" => Ok(ScanProfile::QuickScan),
            "full-audit" | "full" => Ok(ScanProfile::FullAudit),
            "dependency-only" => Ok(ScanProfile::DependencyOnly),
            "quality-only" => Ok(ScanProfile::QualityOnly),
            "all-checks" | "all" => Ok(ScanProfile::AllChecks),
            _ => bail!(
                "unknown scan profile: {s:?} \
                 (valid: quick-scan, full-audit, dependency-only, quality-only, all-checks)"
            ),
        }
    }
}

/// A logical grouping of tools addressing one concern.
///
/// The declaration order is the execution and reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    DependencyVulnerability,
    StaticSecurity,
    CodeQuality,
}

impl StageKind {
    pub const ORDERED: [StageKind; 3] = [
        StageKind::DependencyVulnerability,
        StageKind::StaticSecurity,
        StageKind::CodeQuality,
    ];
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::DependencyVulnerability => write!(f, "dependency-vulnerability"),
            StageKind::StaticSecurity => write!(f, "static-security"),
            StageKind::CodeQuality => write!(f, "code-quality"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedMode {
    /// High-severity checks only; heavy tools are skipped.
    Fast,
    Full,
}

impl fmt::Display for SpeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeedMode::Fast => write!(f, "fast"),
            SpeedMode::Full => write!(f, "full"),
        }
    }
}

/// Whether `stage` runs under `profile`.
pub fn is_active(profile: ScanProfile, stage: StageKind) -> bool {
    use ScanProfile::*;
    use StageKind::*;

    match (profile, stage) {
        (QuickScan | FullAudit | DependencyOnly | AllChecks, DependencyVulnerability) => true,
        (QuickScan | FullAudit | AllChecks, StaticSecurity) => true,
        (QualityOnly | AllChecks, CodeQuality) => true,
        _ => false,
    }
}

/// The set of stages that run under `profile`.
pub fn active_stages(profile: ScanProfile) -> BTreeSet<StageKind> {
    StageKind::ORDERED
        .into_iter()
        .filter(|stage| is_active(profile, *stage))
        .collect()
}

/// Only `QuickScan` runs in fast mode. The mode selects severity flags for
/// static analysis and the reduced tool subset for dependency scanning;
/// code quality tools have no fast variant.
pub fn speed_mode(profile: ScanProfile, stage: StageKind) -> SpeedMode {
    match (profile, stage) {
        (
            ScanProfile::QuickScan,
            StageKind::StaticSecurity | StageKind::DependencyVulnerability,
        ) => SpeedMode::Fast,
        _ => SpeedMode::Full,
    }
}
