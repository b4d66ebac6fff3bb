use std::io::Write;

use crate::runner::{OutcomeStatus, ToolOutcome};
use crate::summary::{RunSummary, StageResult};

pub trait OutputFormatter {
    fn write_summary(&self, summary: &RunSummary, writer: &mut dyn Write) -> std::io::Result<()>;
}

pub struct TextOutput;

impl TextOutput {
    fn write_stage(stage: &StageResult, writer: &mut dyn Write) -> std::io::Result<()> {
        if !stage.active {
            writeln!(writer, "[{}] inactive", stage.stage)?;
            writeln!(writer, "  skipped by profile")?;
            return Ok(());
        }

        writeln!(writer, "[{}] active", stage.stage)?;
        if stage.outcomes.is_empty() {
            writeln!(writer, "  no tools selected")?;
        }
        for outcome in &stage.outcomes {
            Self::write_outcome(outcome, writer)?;
        }
        Ok(())
    }

    fn write_outcome(outcome: &ToolOutcome, writer: &mut dyn Write) -> std::io::Result<()> {
        // Display impls ignore width, so pad the rendered status.
        let status = outcome.status.to_string();
        write!(
            writer,
            "  {:<12} {:<18} {:>8}ms",
            outcome.tool_id, status, outcome.duration_ms
        )?;
        if let Some(detail) = &outcome.detail {
            write!(writer, "  ({detail})")?;
        }
        writeln!(writer)?;
        match &outcome.artifact {
            Some(artifact) => writeln!(writer, "    artifact: {artifact}")?,
            None => writeln!(writer, "    artifact: none")?,
        }
        Ok(())
    }
}

impl OutputFormatter for TextOutput {
    fn write_summary(&self, summary: &RunSummary, writer: &mut dyn Write) -> std::io::Result<()> {
        writeln!(writer, "scan summary")?;
        writeln!(writer, "  run:     {}", summary.run_id())?;
        writeln!(writer, "  profile: {}", summary.profile())?;
        writeln!(
            writer,
            "  started: {}",
            summary.started_at().format("%Y-%m-%dT%H:%M:%SZ")
        )?;
        writeln!(writer, "  status:  {}", summary.overall_status())?;
        writeln!(writer)?;

        for stage in summary.stage_results() {
            Self::write_stage(stage, writer)?;
        }

        writeln!(writer)?;
        let totals: Vec<String> = [
            OutcomeStatus::Ran,
            OutcomeStatus::RanWithFindings,
            OutcomeStatus::ToolMissing,
            OutcomeStatus::TimedOut,
            OutcomeStatus::Crashed,
        ]
        .iter()
        .map(|status| format!("{status} {}", summary.count(*status)))
        .collect();
        writeln!(writer, "totals: {}", totals.join(", "))?;

        if !summary.errors().is_empty() {
            writeln!(writer, "stage errors:")?;
            for err in summary.errors() {
                writeln!(writer, "  {}: {}", err.stage, err.message)?;
            }
        }
        Ok(())
    }
}

pub struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn write_summary(&self, summary: &RunSummary, writer: &mut dyn Write) -> std::io::Result<()> {
        serde_json::to_writer_pretty(&mut *writer, summary)?;
        writeln!(writer)?;
        Ok(())
    }
}

pub fn formatter(json: bool) -> Box<dyn OutputFormatter> {
    if json {
        Box::new(JsonOutput)
    } else {
        Box::new(TextOutput)
    }
}

/// Renders the human-readable summary document.
pub fn summarize(summary: &RunSummary) -> String {
    render(&TextOutput, summary)
}

pub fn render(formatter: &dyn OutputFormatter, summary: &RunSummary) -> String {
    let mut buf = Vec::new();
    formatter
        .write_summary(summary, &mut buf)
        .expect("writing to a Vec cannot fail");
    String::from_utf8_lossy(&buf).into_owned()
}
