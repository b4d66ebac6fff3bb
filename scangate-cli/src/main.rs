mod cli;

use std::io::Write;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use scangate::output::{OutputFormatter, formatter};
use scangate::{Orchestrator, OverallStatus, RunReport, RunRequest, ScanConfig};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;

const EXIT_WARNINGS: u8 = 1;
const EXIT_FAILED: u8 = 2;
const EXIT_SETUP: u8 = 3;

fn init_logging(args: &Cli) {
    let filter = EnvFilter::builder()
        .with_default_directive(args.verbosity.tracing_level_filter().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Cli) -> Result<ScanConfig> {
    let mut config = ScanConfig::load(args.config.as_deref())?;
    if let Some(dir) = &args.artifact_dir {
        config.artifact_dir = dir.clone();
    }
    Ok(config)
}

fn exit_code(report: &RunReport, strict: bool) -> ExitCode {
    match report.summary.overall_status() {
        OverallStatus::Success => ExitCode::SUCCESS,
        OverallStatus::SuccessWithWarnings if strict => ExitCode::from(EXIT_WARNINGS),
        OverallStatus::SuccessWithWarnings => ExitCode::SUCCESS,
        OverallStatus::Failed => ExitCode::from(EXIT_FAILED),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_logging(&args);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    let orchestrator = Orchestrator::from_config(&config);
    let request = RunRequest {
        profile: args.profile,
        target: args.target.clone(),
        run_downstream: args.run_downstream,
    };

    let report = match orchestrator.run(&request).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %format!("{e:#}"), "scan aborted");
            eprintln!("error: {e:#}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    if let Some(e) = &report.downstream_error {
        warn!(error = %e, "downstream job did not complete");
    }

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = formatter(args.json)
        .write_summary(&report.summary, &mut stdout)
        .and_then(|()| stdout.flush())
    {
        eprintln!("error: failed to write summary: {e}");
    }

    exit_code(&report, args.strict)
}
