use std::process::ExitCode;

fn main() -> ExitCode {
    ichigo_cli::run()
}
