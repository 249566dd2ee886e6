//! RSSP Service HTTP Server

use axum::{
    Router,
    routing::{get, post},
};
use rssp::{Device, SoftDevice};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

use crate::bootstrap;
use crate::config::{DeviceKind, RsspConfig};
use crate::handlers::{self, AppState};

/// Create and configure the Axum router
pub fn create_router<D: Device>(state: Arc<AppState<D>>) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        // CSC v1
        .route("/csc/v1/info", post(handlers::info::<D>))
        .route("/csc/v1/credentials/list", post(handlers::credentials_list::<D>))
        .route("/csc/v1/credentials/info", post(handlers::credentials_info::<D>))
        .route("/csc/v1/credentials/authorize", post(handlers::authorize::<D>))
        .route("/csc/v1/signatures/signHash", post(handlers::sign_hash::<D>))
        .with_state(state)
}

/// Run the HTTP server on the configured device
pub async fn run(
    listener: tokio::net::TcpListener,
    config: RsspConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match config.device {
        DeviceKind::Software => {
            info!("Using in-process software device");
            serve(listener, &config, Arc::new(SoftDevice::new())).await
        }
        #[cfg(feature = "pkcs11")]
        DeviceKind::Pkcs11 => {
            info!("Initializing PKCS#11 device from {}", config.pkcs11_library);
            let device = bootstrap::open_pkcs11(&config)
                .map_err(|e| format!("Failed to initialize HSM: {}", e))?;
            serve(listener, &config, Arc::new(device)).await
        }
        #[cfg(not(feature = "pkcs11"))]
        DeviceKind::Pkcs11 => Err("Built without PKCS#11 support".into()),
    }
}

async fn serve<D: Device>(
    listener: tokio::net::TcpListener,
    config: &RsspConfig,
    device: Arc<D>,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = bootstrap::signing_service(config, device)
        .map_err(|e| format!("Failed to initialize signing service: {}", e))?;

    let state = Arc::new(AppState {
        service,
        access_tokens: bootstrap::access_tokens(config),
        info: bootstrap::service_info(),
    });

    let app = create_router(state.clone());

    info!(
        "RSSP service listening on {}",
        listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.service.key_wrap().pool().shutdown();
    info!("Closed idle device sessions");

    Ok(())
}

/// Wait for SIGTERM or SIGINT signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Starting graceful shutdown...");
}
