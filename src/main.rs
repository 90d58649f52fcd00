//! Herald - content announcement daemon
//!
//! Advertises the CIDs a storage node serves and keeps the
//! advertisements fresh across restarts.

use std::process::ExitCode;

use herald_core::{run_node, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_cli() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("herald: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run_node(config).await {
        tracing::error!(error = %e, "node exited with error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
