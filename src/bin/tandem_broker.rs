//! Standalone broker process.

use clap::Parser;
use tandem::runner::{self, NodeArgs};

fn main() -> std::process::ExitCode {
    let args = NodeArgs::parse();
    runner::init_logging(&args);
    match runner::run_broker(&args) {
        Ok(code) => std::process::ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("broker failed: {err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
