//! Output formatting for the final run report.

pub mod json;
pub mod plain;

use crate::coordinator::RunReport;
use crate::error::Result;
use clap::ValueEnum;

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// The result matrices as text (default).
    #[default]
    Plain,
    /// The full report as JSON.
    Json,
}

/// Format and print the final report to stdout.
pub fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Plain => plain::print_plain(report),
        OutputFormat::Json => json::print_json(report)?,
    }
    Ok(())
}
