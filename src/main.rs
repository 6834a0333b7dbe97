use engagement_stats::orchestrator::DEFAULT_IDLE_TIMEOUT;
use engagement_stats::{resolve_data_path, resolve_export_dir, router, AppState, FileDelivery, JsonFileStore};
use std::{env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let data_path = resolve_data_path()?;
    if let Some(parent) = data_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let export_dir = resolve_export_dir();
    let idle_timeout = env::var("APP_IDLE_SAVE_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_IDLE_TIMEOUT);

    info!(
        "data file {}, exporting under {}",
        data_path.display(),
        export_dir.display()
    );
    let storage = Arc::new(JsonFileStore::open(data_path).await);
    let delivery = Arc::new(FileDelivery::new(export_dir));
    let state = AppState::new(storage, delivery, idle_timeout);

    if let Err(err) = state.orchestrator.restore().await {
        warn!("starting without restored state: {err}");
    }
    let watcher = state.orchestrator.spawn_settings_watcher();
    let orchestrator = state.orchestrator.clone();

    let app = router(state);

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watcher.abort();
    match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, orchestrator.flush_on_unload()).await {
        Ok(outcome) => info!("shutdown flush finished: {outcome:?}"),
        Err(_) => warn!("shutdown flush timed out"),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
