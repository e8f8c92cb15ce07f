use std::process::ExitCode;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use beamsim::{ServerBuilder, catalog, utils};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = utils::get_default_server_port();
    let server = match ServerBuilder::new(catalog::beamline()).port(port).start().await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start server on port {port}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("beamline simulator listening on port {}", server.local_port());

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("failed to install signal handler: {e}");
            return ExitCode::FAILURE;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = terminate.recv() => info!("termination requested, shutting down"),
    }

    if let Err(e) = server.stop().await {
        error!("error during shutdown: {e}");
        return ExitCode::FAILURE;
    }
    info!("server shutdown complete");
    ExitCode::SUCCESS
}
