mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;
mod storage;
mod utils;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::services::hash::HashAlgorithm;
use crate::state::AppState;
use crate::storage::drive::DriveProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialize logging; RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    let hash_algorithm: HashAlgorithm = config.hash_algorithm.parse()?;
    tracing::info!(
        algorithm = hash_algorithm.as_str(),
        "Starting dedupe server on {}:{}",
        config.host,
        config.port
    );

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    // Initialize database
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path, config.db_pool_size);
    migrate(&pool, &config.data_dir)?;

    // Storage provider client (folder cache lives inside it)
    let provider = Arc::new(DriveProvider::new(&config));

    // Build application state
    let state = Arc::new(AppState::new(pool, config.clone(), provider, hash_algorithm));

    // Build router
    let app = routes::create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    if config.tls_enabled {
        let cert = config
            .tls_cert_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TLS_CERT_PATH is required when TLS is enabled"))?;
        let key = config
            .tls_key_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TLS_KEY_PATH is required when TLS is enabled"))?;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
        tracing::info!("Listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    tracing::info!("Shutting down...");
    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
