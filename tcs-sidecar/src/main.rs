use std::process::ExitCode;

use clap::Parser;
use tcs_sidecar::{init_logging, SidecarConfig};
use tracing::error;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let config = SidecarConfig::parse();
    init_logging(config.log_json);

    match tcs_sidecar::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "sidecar stopped");
            ExitCode::FAILURE
        }
    }
}
