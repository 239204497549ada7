use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use git_workspace_daemon::{
    admission::{GLOBAL_LIMIT, PAIRING_LIMIT, RateLimiter},
    config::{self, ConfigStore},
    handlers::router,
    jobs::JobManager,
    pairing::PairingManager,
    state::AppState,
    tokens::TokenStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = config::config_dir();
    let logs_dir = config_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "daemon.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,git_workspace_daemon=info".to_string()),
        )
        .json()
        .with_writer(file_writer.and(std::io::stderr))
        .init();

    let config_store = ConfigStore::load(&config_dir)?;
    let config = config_store.get();
    config.validate()?;

    let state = AppState {
        config: Arc::new(config_store),
        tokens: Arc::new(TokenStore::load(&config_dir)?),
        pairing: Arc::new(PairingManager::new()),
        jobs: JobManager::new(
            config.jobs.max_concurrent,
            Duration::from_secs(config.jobs.timeout_seconds),
        ),
        global_limiter: Arc::new(RateLimiter::new(GLOBAL_LIMIT)),
        pairing_limiter: Arc::new(RateLimiter::new(PAIRING_LIMIT)),
        config_dir: config_dir.clone(),
    };

    let app: Router = router(state);

    let bind_addr = bind_address(&config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind_addr = %bind_addr, "git workspace daemon listening");
    if config.tls.enabled {
        // The TLS mirror carries the same routes and filters; its listener
        // is wired by the deployment, not here.
        info!(port = config.tls.port, "TLS mirror configured");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("daemon stopped");
    Ok(())
}

fn bind_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler installs");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installs")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
