//! Serve mode — the coordinator.
//!
//! Opens the job, node and project stores, starts the reaper that times out
//! abandoned work, and serves the node protocol plus management API until
//! Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use farm_core::FarmConfig;
use farmgrid_api::{ApiState, build_router};
use farmgrid_scheduler::Scheduler;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run the coordinator.
pub async fn run_serve(config: FarmConfig) -> anyhow::Result<()> {
    info!("FarmGrid coordinator starting");
    anyhow::ensure!(
        config.scheduler.reap_interval_secs > 0.0,
        "scheduler.reap_interval_secs must be positive"
    );
    let reap_interval = Duration::try_from_secs_f64(config.scheduler.reap_interval_secs)?;

    // ── Scheduler ──────────────────────────────────────────────

    let scheduler = Arc::new(Scheduler::open(&config)?);
    info!(
        jobs = ?config.store.jobs_path(),
        nodes = ?config.store.nodes_path(),
        task_timeout_secs = scheduler.task_timeout(),
        "scheduler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Reaper ─────────────────────────────────────────────────

    let reaper_handle = tokio::spawn(reap_loop(
        Arc::clone(&scheduler),
        reap_interval,
        shutdown_rx,
    ));

    // ── API server ─────────────────────────────────────────────

    let router = build_router(ApiState::new(scheduler, config.protocol.clone()));
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(addr = %listener.local_addr()?, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl-C, running until killed");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = reaper_handle.await;

    info!("FarmGrid coordinator stopped");
    Ok(())
}

/// Periodically return timed out work to the queue (or fail it, when
/// retries are off).
pub async fn reap_loop(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs_f64(), "reaper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let scheduler = Arc::clone(&scheduler);
                match tokio::task::spawn_blocking(move || scheduler.reap_expired()).await {
                    Ok(Ok(report)) if report.jobs > 0 => info!(
                        jobs = report.jobs,
                        requeued = report.requeued,
                        failed = report.failed,
                        "expired work reaped"
                    ),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "reap failed"),
                    Err(e) => error!(error = %e, "reap task panicked"),
                }
            }
            _ = shutdown.changed() => {
                info!("reaper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FarmConfig::default();
        config.store.data_dir = dir.path().to_path_buf();
        let scheduler = Arc::new(Scheduler::open(&config).unwrap());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reap_loop(scheduler, Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn zero_reap_interval_is_rejected() {
        let mut config = FarmConfig::default();
        config.scheduler.reap_interval_secs = 0.0;
        assert!(run_serve(config).await.is_err());
    }
}
