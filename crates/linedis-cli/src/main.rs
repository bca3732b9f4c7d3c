use std::{io, process::ExitCode};

use clap::{Parser, error::ErrorKind};
use linedis::{FunctionDetailMode, ReportError, ReportOptions, generate_report};
use tracing::Level;

/// Printed for any argument list that doesn't name exactly one input file.
const USAGE: &str = "Usage: linedis <input_filename>";

/// linedis: show which bytecode instructions each line of a Python file compiles to.
///
/// - `linedis <file>` prints the line mapping of the module and a listing of every
///   function defined at the top level
/// - `linedis --group-by-line <file>` lists function instructions under the line they
///   belong to instead of pairing them positionally with the function's lines
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Group each function's instructions by source line.
    #[arg(long = "group-by-line")]
    group_by_line: bool,

    /// Log pipeline stages to stderr, repeat for more detail.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Python source file to analyze.
    file: String,
}

impl Cli {
    fn options(&self) -> ReportOptions {
        let function_detail = if self.group_by_line {
            FunctionDetailMode::Grouped
        } else {
            FunctionDetailMode::Positional
        };
        ReportOptions { function_detail }
    }

    fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            // help and version text go to stdout and exit successfully
            return match err.print() {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            };
        }
        Err(_) => {
            println!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level())
        .with_writer(io::stderr)
        .init();

    run(&cli);
    ExitCode::SUCCESS
}

/// Generates and prints the report for `cli.file`.
///
/// Failures are reported on stdout in place of the report; they never change the exit status.
fn run(cli: &Cli) {
    match generate_report(&cli.file, &cli.options()) {
        Ok(report) => println!("{report}"),
        Err(ReportError::FileNotFound { path }) => println!("Error: File '{}' not found.", path.display()),
        Err(err) => {
            tracing::debug!(error = ?err, "report generation failed");
            println!("An error occurred: {err}");
        }
    }
}
