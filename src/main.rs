use std::process::ExitCode;

use clap::Parser;
use kubeforward_lib::cli::{execute, CliArgs};

// Use mimalloc as the global allocator for the many small relay buffers
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    kubeforward_lib::init_logging();

    match execute(CliArgs::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
