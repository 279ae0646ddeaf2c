//! Entry point for the node verification daemon.

use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    match wardend::run_daemon() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            // Telemetry may not be installed yet, so report directly.
            writeln!(io::stderr().lock(), "wardend: {error}").ok();
            ExitCode::FAILURE
        }
    }
}
