use std::sync::Arc;

use clap::Parser;
use ispmon::{
    AdapterConfig, AdapterRegistry, PollerHandle,
    config::read_config_file,
    storage,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("ispmon", LevelFilter::DEBUG),
        ("ispmon_poller", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let mut config = read_config_file(&args.file)?;
    config.poller.apply_env();

    let storage = storage::open(config.storage.as_ref()).await?;
    let health = storage.metrics.health_check().await?;
    info!("storage: {} {:?}", health.message, health.metadata);

    for device in &config.devices {
        if let Err(e) = storage.devices.upsert_device(device).await {
            error!("failed to seed device {}: {e}", device.name);
        }
    }
    info!("seeded {} device(s)", config.devices.len());
    for device in config.devices_outpacing_tick() {
        warn!(
            "{} polls every {}s, not longer than the {}s tick; it will be polled less often",
            device.name, device.polling_interval_secs, config.poller.tick_interval_secs
        );
    }

    let registry = AdapterRegistry::with_defaults(&AdapterConfig::from(&config.poller))?;

    let cancel = CancellationToken::new();
    let poller = PollerHandle::spawn(
        &config.poller,
        Arc::new(registry),
        storage.devices,
        storage.metrics,
        cancel.clone(),
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c"),
        Err(e) => warn!("failed to listen for ctrl-c: {e}"),
    }

    let stats = poller.shutdown().await?;
    info!("final stats: {stats:?}");

    Ok(())
}
