use std::process::ExitCode;

use app::{cli, telemetry};
use tracing::error;

/// Exit code for unrecoverable configuration problems; the process
/// supervisor treats any non-zero code as restart-worthy, so config
/// errors get their own value to aid triage.
const EXIT_CONFIG: u8 = 2;

fn main() -> ExitCode {
    telemetry::init();

    match cli::dispatch() {
        Ok(()) => ExitCode::SUCCESS,
        Err(cli::FatalError::Config(err)) => {
            error!("configuration error: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(cli::FatalError::Runtime(err)) => {
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
