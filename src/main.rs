use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use corral::http::{self, AppState};
use corral::sync::{HttpFetcher, Synchronizer};
use corral::tenant::TenantManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("CORRAL_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    corral::observability::init(metrics_port);

    let port = std::env::var("CORRAL_PORT").unwrap_or_else(|_| "7070".into());
    let bind = std::env::var("CORRAL_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("CORRAL_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let api_key = std::env::var("CORRAL_API_KEY").ok();
    let compact_threshold: u64 = std::env::var("CORRAL_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let sync_concurrency: usize = std::env::var("CORRAL_SYNC_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(corral::limits::DEFAULT_SYNC_CONCURRENCY);
    let fetch_timeout_secs: u64 = std::env::var("CORRAL_FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or((corral::limits::DEFAULT_FETCH_TIMEOUT_MS / 1000) as u64);

    std::fs::create_dir_all(&data_dir)?;

    let tenants = Arc::new(TenantManager::new(
        PathBuf::from(&data_dir),
        compact_threshold,
    ));
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(fetch_timeout_secs))?);
    let sync = Arc::new(Synchronizer::new(fetcher, sync_concurrency));

    let app = http::router(AppState {
        tenants,
        sync,
        api_key: api_key.clone(),
    });

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("corral listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  api_key: {}", if api_key.is_some() { "required" } else { "disabled" });
    info!("  sync_concurrency: {sync_concurrency}");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("corral stopped");
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}
