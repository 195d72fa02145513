use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::get;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let boot = clproxy_core::bootstrap::bootstrap_from_env().await?;
    let host = boot.config.host.clone();
    let port = boot.config.port;

    let app = axum::Router::new()
        .merge(clproxy_router::proxy_router(boot.state.clone()))
        .nest("/admin", clproxy_router::admin_router(boot.state.clone()))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }));

    let bind = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, "clproxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(boot.state))
        .await?;
    Ok(())
}

async fn shutdown_signal(state: std::sync::Arc<clproxy_core::AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down, draining health sweeper");
    state.manager().shutdown().await;
}
