//! Plain text output: the result matrices only.

use crate::accumulator::FinalState;
use crate::coordinator::RunReport;
use crate::matrix::render_row;

/// Render the final state.
///
/// Placement prints `R=[...]`, summation `Final rSum Matrix=[...]`. History
/// prints one section per weight matrix, each with that weight's blocks in
/// iteration order; with several weights the header names the weight.
pub fn render_plain(report: &RunReport) -> String {
    match &report.state {
        FinalState::Place(matrix) => matrix.render("R"),
        FinalState::Sum(matrix) => matrix.render("Final rSum Matrix"),
        FinalState::History(blocks) => {
            let weights = report.weights.len().max(1);
            let sections: Vec<String> = (0..weights)
                .map(|weight| {
                    let mut out = match report.weights.get(weight) {
                        Some(name) if weights > 1 => format!(
                            "rMatrix for {} A matrices x {}=[\n",
                            report.iterations, name
                        ),
                        _ => format!("rMatrix for {} A matrices=[\n", report.iterations),
                    };
                    for block in blocks.iter().filter(|b| b.weight == weight) {
                        for row in block.matrix.to_rows() {
                            out.push_str(&render_row(&row));
                            out.push('\n');
                        }
                    }
                    out.push(']');
                    out
                })
                .collect();
            sections.join("\n")
        }
    }
}

/// Print the final state as plain text.
pub fn print_plain(report: &RunReport) {
    println!("{}", render_plain(report));
}
