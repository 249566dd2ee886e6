//! RSSP Service - CSC v1 remote signing over HTTP

use rssp_service::RsspConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rssp=info,rssp_service=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting RSSP Service");

    let config =
        RsspConfig::from_env().map_err(|e| format!("Invalid configuration: {}", e))?;

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    rssp_service::server::run(listener, config).await?;

    Ok(())
}
