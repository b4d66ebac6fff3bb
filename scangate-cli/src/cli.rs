use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use scangate::ScanProfile;

/// Run security and quality scanners against a codebase and gate the
/// downstream data job on the result
#[derive(Parser)]
#[command(name = "scangate", version)]
pub struct Cli {
    /// Scan profile: quick-scan, full-audit, dependency-only, quality-only, all-checks
    #[arg(short, long, env = "SCANGATE_PROFILE", default_value = "quick-scan")]
    pub profile: ScanProfile,

    /// Directory to scan
    #[arg(short, long, default_value = ".")]
    pub target: PathBuf,

    /// Run the downstream job when the scan does not fail
    #[arg(long, alias = "run-scrape")]
    pub run_downstream: bool,

    /// YAML configuration file
    #[arg(short, long, env = "SCANGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Where reports and the summary are written (overrides the config file)
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long)]
    pub log_json: bool,

    /// Exit non-zero when the scan has warnings
    #[arg(long)]
    pub strict: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}
