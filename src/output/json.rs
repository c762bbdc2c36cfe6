//! JSON output for the run report.

use crate::coordinator::RunReport;
use crate::error::Result;

/// Render the report as pretty-printed JSON.
pub fn render_json(report: &RunReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Print the report as JSON.
pub fn print_json(report: &RunReport) -> Result<()> {
    println!("{}", render_json(report)?);
    Ok(())
}
