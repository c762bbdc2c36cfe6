//! mxpool command-line entry point.

use anyhow::Result;
use clap::Parser;
use mxpool::cli::Cli;
use mxpool::config::RunConfig;
use mxpool::{coordinator, logging, output, worker};
use owo_colors::{OwoColorize, Stream::Stderr};

/// Parses arguments, runs either the hidden worker mode or a coordinator
/// run, and reports a fatal error as a single line on stderr.
fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Help and version are not failures
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    if cli.internal_worker {
        match cli.worker_startup() {
            Ok(startup) => worker::run_worker_main(startup),
            Err(e) => {
                eprintln!("Worker error: {}", e);
                std::process::exit(1);
            }
        }
    }

    logging::init(cli.log_config());

    if let Err(e) = cmd_run(&cli) {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        std::process::exit(1);
    }
}

fn cmd_run(cli: &Cli) -> Result<()> {
    let config = RunConfig::from_cli(cli)?;
    tracing::debug!(workers = config.worker_count(), "Resolved run configuration");

    let report = if config.stream {
        coordinator::run(&config, std::io::stdin().lock())?
    } else {
        coordinator::run(&config, std::io::empty())?
    };

    output::print_report(&report, cli.format)?;
    Ok(())
}
