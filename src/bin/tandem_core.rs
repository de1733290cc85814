//! Standalone core process. With `--autobroker` it hosts the broker too.

use clap::Parser;
use tandem::runner::{self, NodeArgs};

fn main() -> std::process::ExitCode {
    let args = NodeArgs::parse();
    runner::init_logging(&args);
    match runner::start_core(&args) {
        Ok(core) => {
            // Runs until the federation drains and the broker terminates
            // the core.
            core.join();
            std::process::ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("core failed: {err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
