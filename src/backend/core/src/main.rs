//! Runforge Server - Main entry point

use std::net::SocketAddr;

use runforge_core::{
    api,
    config::Config,
    context::AppContext,
    telemetry::init_telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    let metrics = init_telemetry(&config.telemetry())?.metrics;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.paths.data_dir.display(),
        "Starting Runforge Server"
    );

    let host = config.server.host.clone();
    let port = config.server.port;

    let ctx = AppContext::connect(config, metrics).await?;
    tracing::info!("Connected to database");

    let status = ctx.start().await?;
    if !status.available {
        tracing::warn!(
            reason = status.reason.as_deref().unwrap_or("unknown"),
            "Scheduler running in registry-only mode"
        );
    }

    let app = api::build_router(ctx.clone());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ctx.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
