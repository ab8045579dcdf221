use anyhow::Result;
use chrono::Utc;
use stackpilot::*;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// How often persisted budget rows outside the window are dropped.
const PRUNE_INTERVAL_SECS: u64 = 3600;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!("{} {} starting", version::NAME, version::VERSION);

    let client: Arc<dyn remote::RemoteClient> = Arc::new(remote::PortainerClient::new(
        &app_config.portainer.url,
        app_config.portainer.credentials()?,
        app_config.portainer.timeout(),
        app_config.portainer.ssl_verify,
    )?);

    let cache_repo = if app_config.persistence.enabled {
        let repo = cache_repo::CacheRepo::connect(&app_config.persistence.path).await?;
        repo.init().await?;
        Some(Arc::new(repo))
    } else {
        None
    };

    let pilot = Arc::new(service::StackPilot::new(
        client,
        app_config.endpoints(),
        service::ServiceSettings::from(&app_config),
        cache_repo,
    ));
    if let Err(e) = pilot.detector().restore(Utc::now()).await {
        tracing::warn!(error = %e, operation = "restore", "Failed to restore update-check state");
    }

    let ws_event_connections = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let worker_handle = worker::spawn(
        worker::WorkerDeps {
            pilot: pilot.clone(),
            ws_event_connections: ws_event_connections.clone(),
            shutdown_rx,
        },
        worker::WorkerConfig {
            refresh_interval_secs: app_config.refresh.interval_secs,
            check_on_refresh: app_config.update_checks.enabled
                && app_config.update_checks.check_on_refresh,
            stats_log_interval_secs: app_config.refresh.stats_log_interval_secs,
            prune_interval_secs: PRUNE_INTERVAL_SECS,
        },
    );

    let app = routes::app(pilot, ws_event_connections);
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let in_container = std::path::Path::new("/.dockerenv").exists()
        || std::env::var("CONTAINER").as_deref() == Ok("1");

    if in_container {
        // In Docker: run server until error or SIGTERM (no signal handler; avoids immediate exit)
        axum::serve(listener, app).await?;
    } else {
        tokio::select! {
            result = axum::serve(listener, app) => {
                result?;
            }
            _ = async {
                #[cfg(unix)]
                {
                    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        Ok(s) => s,
                        Err(_) => {
                            let _ = tokio::signal::ctrl_c().await;
                            return;
                        }
                    };
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::signal::ctrl_c().await;
                }
            } => {
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx.send(());
                let _ = worker_handle.await;
            }
        }
    }

    Ok(())
}
