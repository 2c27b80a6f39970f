//! WeMo device manager
//!
//! Loads `configuration.yaml` and the stored config entries from the config
//! directory, imports statically configured devices and sets every entry up.
//! Runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wemo_config::WemoConfig;
use wemo_config_entries::ConfigEntries;
use wemo_discovery::http::{HttpDescriptionFetcher, HttpPortProbe};
use wemo_discovery::{EndpointResolver, ResolutionCache};
use wemo_event_bus::{DeviceStateTracker, EventBus, LocalSubscriptionRegistry};
use wemo_integration::WemoIntegration;
use wemo_registries::{DeviceRegistry, Storage};

#[derive(Parser, Debug)]
#[command(name = "wemo")]
#[command(about = "Resolve, configure and track WeMo devices")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Directory holding configuration.yaml and .storage/
    #[arg(short, long, env = "WEMO_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!("Starting WeMo manager, config dir {:?}", args.config_dir);

    let root = wemo_config::load_yaml(&args.config_dir).context("loading configuration")?;
    let config = WemoConfig::from_root(&root).context("invalid wemo configuration")?;

    let storage = Arc::new(Storage::new(&args.config_dir));
    let entries = Arc::new(ConfigEntries::new(Arc::clone(&storage)));
    entries.load().await.context("loading config entries")?;
    let devices = Arc::new(DeviceRegistry::new(storage));
    devices.load().await.context("loading device registry")?;

    let resolver = Arc::new(EndpointResolver::new(
        Arc::new(HttpDescriptionFetcher::new().context("building HTTP client")?),
        Arc::new(HttpPortProbe::new().context("building HTTP client")?),
        Arc::new(ResolutionCache::new()),
    ));

    let bus = Arc::new(EventBus::new());
    let tracker = Arc::new(DeviceStateTracker::new());
    let tracker_task = Arc::clone(&tracker).spawn(bus.subscribe_all());
    let subscriptions = Arc::new(LocalSubscriptionRegistry::new(Arc::clone(&bus)));

    let integration = WemoIntegration::new(entries, devices, resolver, subscriptions, tracker);
    integration.async_setup(&config).await?;
    let loaded = integration.setup_all().await;

    info!(
        "WeMo manager running, {} of {} entries loaded",
        loaded,
        integration.entries().len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    integration.shutdown().await;
    tracker_task.abort();
    Ok(())
}
