use std::process::ExitCode;

use sensorlog::port;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    eprintln!("Serial port list (v{})", env!("CARGO_PKG_VERSION"));

    let candidates = match port::available_candidates() {
        Ok(candidates) => candidates,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if candidates.is_empty() {
        eprintln!("No serial ports found");
        return ExitCode::SUCCESS;
    }

    let detected = port::find_device_port(&candidates).map(|candidate| candidate.name.clone());
    for candidate in &candidates {
        let marker = if Some(&candidate.name) == detected.as_ref() {
            " (auto-detected)"
        } else {
            ""
        };
        println!("{}: {}{marker}", candidate.name, candidate.description);
    }
    ExitCode::SUCCESS
}
