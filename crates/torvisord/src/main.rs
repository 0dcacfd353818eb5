use std::process::ExitCode;

fn main() -> ExitCode {
    match torvisord::run_daemon() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("torvisord: {error}");
            ExitCode::FAILURE
        }
    }
}
