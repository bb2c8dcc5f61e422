use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

mod config;
mod routes;
mod telemetry;

use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    let config = ServerConfig::parse();

    info!("Grace server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        pid = std::process::id(),
        ppid = unsafe { libc::getppid() },
        restart = grace::is_restart(),
        "Process started"
    );
    config.log_config();

    let listener = grace::acquire_listener(&config.addr)
        .await
        .with_context(|| format!("Failed to acquire listener on {}", config.addr))?;
    info!(addr = %listener.local_addr(), "Listening");

    let result = config
        .grace_server()
        .serve(listener, routes::create_router())
        .await;

    match result {
        Ok(()) => {
            info!("Server stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server stopped with error");
            Err(e).context("Server failed")
        }
    }
}
