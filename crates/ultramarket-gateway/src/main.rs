//! UltraMarket gateway binary.
//!
//! Edge gateway that authenticates, rate limits and routes requests to the
//! platform's backend services.

use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ultramarket_gateway::{GatewayConfig, GatewayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ultramarket_gateway=info")),
        )
        .init();

    info!("UltraMarket gateway starting");

    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load gateway configuration");
            return Err(e.into());
        }
    };

    info!(
        bind_address = %config.server.bind_address,
        services = config.services.len(),
        routes = config.routes.len(),
        "Configuration loaded"
    );

    let server = Arc::new(GatewayServer::build(config)?);
    let cancel = CancellationToken::new();

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown");
        cancel_on_signal.cancel();
    });

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(Arc::clone(&server), cancel.clone()));

    if let Err(e) = server.serve(cancel).await {
        error!(error = %e, "Gateway error");
        return Err(e.into());
    }

    Ok(())
}

/// Reloads the route table from the configuration file on every SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(server: Arc<GatewayServer>, cancel: CancellationToken) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, route reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!("Received SIGHUP, reloading routes");
                match GatewayConfig::load().and_then(|config| server.reload_routes(&config)) {
                    Ok(count) => info!(routes = count, "Routes reloaded"),
                    Err(e) => error!(error = %e, "Route reload failed, keeping current routes"),
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}
