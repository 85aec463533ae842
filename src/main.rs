use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use codectx_config::Config;
use codectx_index::EngineRegistry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> Result<()> {
    let root = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => std::env::current_dir().context("failed to read the current directory")?,
    };
    let config = Config::load(&root)?;
    let watch = config.watcher.enabled;
    let check_every = Duration::from_secs(config.index.staleness_check_secs.max(1));

    let registry = EngineRegistry::with_config(config);
    let engine = registry.get_or_open(&root).await?;

    if let Some(report) = engine.ensure_indexed().await? {
        info!(
            "Initial pass: {} files indexed, {} deferred",
            report.processed,
            report.deferred.len()
        );
    }
    if watch {
        if let Err(e) = engine.watch().await {
            warn!("File watching unavailable: {:#}", e);
        }
    }
    let _timer = engine.spawn_staleness_timer(check_every);

    info!("Serving {}; press Ctrl-C to stop", engine.root().display());
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    engine.stop_watching().await;
    engine.drain().await;
    info!("Shut down");
    Ok(())
}
