use std::process::ExitCode;

fn main() -> ExitCode {
    purchasekit_cli::run()
}
