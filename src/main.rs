use std::{sync::Arc, time::Duration};

use radiorelay::{
    common::{
        banner::{BannerInfo, print_banner},
        logger,
        types::AnyResult,
    },
    configs::Config,
    monitoring::system::format_bytes,
    pipeline::PipelineSupervisor,
    storage,
};
use tracing::{info, warn};

fn main() -> AnyResult<()> {
    let config = Arc::new(Config::load()?);
    logger::init(&config.logging);

    let workers = config.engine.worker_count();
    print_banner(&BannerInfo::default(), workers);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("radiorelay-worker")
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Arc<Config>) -> AnyResult<()> {
    let store = storage::from_config(&config.storage);
    let supervisor = Arc::new(PipelineSupervisor::new(config.clone(), store));

    let events = supervisor.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(target: "radiorelay::events", "{}", json),
                Err(e) => warn!("Failed to encode engine event: {}", e),
            }
        }
    });

    let stats_supervisor = supervisor.clone();
    let stats_interval = Duration::from_secs(config.engine.stats_interval_secs.max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(stats_interval);
        tick.tick().await;
        loop {
            tick.tick().await;
            let stats = stats_supervisor.stats();
            info!(
                "Pipelines: {} ({} healthy, {} degraded, {} unhealthy, {} failed) | RSS {} | CPU {:.1}% system, {:.1}% process",
                stats.pipelines,
                stats.healthy,
                stats.degraded,
                stats.unhealthy,
                stats.failed,
                format_bytes(stats.system.rss_bytes),
                stats.system.system_load * 100.0,
                stats.system.process_load * 100.0
            );
        }
    });

    info!(
        "Audio engine ready: {} Hz, {} channels, {} ms frames, {} workers",
        config.engine.sample_rate,
        config.engine.channels,
        config.engine.frame_ms,
        config.engine.worker_count()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping pipelines");
    supervisor.shutdown().await;
    Ok(())
}
