//! # Hook Dispatch Service
//!
//! Binary entry point. Loads configuration, installs logging, wires the core
//! components and serves until SIGINT/SIGTERM.
//!
//! Exit codes: 1 bind failure, 2 server failure, 3 configuration error,
//! 4 startup failure.

use anyhow::Context;
use hook_dispatch_service::{
    build_state, handlers::default_router, logging::init_logging, start_server, ServiceConfig,
    ServiceError,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded = ServiceConfig::load();

    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_logging(&logging);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration; aborting");
            std::process::exit(3);
        }
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "Service configuration is invalid; aborting");
        std::process::exit(3);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        retry_store = ?config.retry.store,
        failure_policy = ?config.dispatch.failure_policy,
        "Starting hook-dispatch service"
    );

    // An invalid handler pattern is a build defect, not an operator error
    let router = default_router().context("Failed to build handler routing table")?;

    let shutdown = CancellationToken::new();
    let result = match build_state(config, router, shutdown.clone()).await {
        Ok((state, worker)) => start_server(state, worker, shutdown).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(error = %e, "Service failed");
        exit_with(e);
    }

    Ok(())
}

fn exit_with(e: ServiceError) -> ! {
    std::process::exit(e.exit_code())
}
