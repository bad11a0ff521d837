use std::sync::Arc;

use tracing::info;

use safarid::clock::SystemClock;
use safarid::config::Config;
use safarid::engine::Engine;
use safarid::notify::NotifyHub;
use safarid::payment::CardParityDecider;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    safarid::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(config.wal_path(), notify, Arc::new(SystemClock))?
        .with_decider(Arc::new(CardParityDecider {
            success_rate: config.payment_success_rate,
        }))
        .with_default_windows(config.edit_window_secs, config.payment_window_secs);
    let engine = Arc::new(engine);

    info!("safarid started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  bookings: {}, resources: {}", engine.bookings.len(), engine.resources.len());
    info!(
        "  windows: edit {}s, payment {}s",
        config.edit_window_secs, config.payment_window_secs
    );
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let tasks = safarid::sweeper::spawn_sweeper(engine.clone(), config.sweeper.clone());

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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

    info!("shutdown signal received, stopping sweeper");
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }

    // Leave a compact log behind so the next start replays quickly
    if engine.wal_appends_since_compact().await > 0
        && let Err(e) = engine.compact_wal().await
    {
        tracing::warn!("final WAL compaction failed: {e}");
    }

    info!("safarid stopped");
    Ok(())
}
