use std::sync::Arc;

use clap::Parser;
use config::Config;
use dvbguide::{
    channels::{IpChannel, IpChannelList},
    create_app,
    filter::{DayDelta, MAX_EPG_DAYS},
    load_ip_playlist,
    manager::{DvbManager, ManagerConfig},
    metrics::MonitoringConfig,
    middleware::Middleware,
    simulated::{Fixture, SimulatedMiddleware},
};
use serde::de::Deserializer;
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Middleware fixture to run against (overrides config)
    #[arg(long)]
    fixture: Option<String>,

    /// Service list index (overrides config)
    #[arg(long)]
    list_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct Settings {
    server: ServerConfig,
    #[serde(default)]
    channels: ChannelsConfig,
    #[serde(default)]
    epg: EpgConfig,
    #[serde(default)]
    middleware: MiddlewareConfig,
    #[serde(default)]
    monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    host: String,
    port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelsConfig {
    #[serde(default)]
    list_index: usize,
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    ip_playlist: Vec<String>,
}

fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => Ok(vec![s]),
        OneOrMany::Many(v) => Ok(v),
    }
}

#[derive(Debug, Deserialize)]
struct EpgConfig {
    #[serde(default = "default_max_days")]
    max_days: u32,
    #[serde(default = "default_true")]
    reload_on_change: bool,
    #[serde(default = "default_true")]
    load_on_start: bool,
}

impl Default for EpgConfig {
    fn default() -> Self {
        Self {
            max_days: default_max_days(),
            reload_on_change: true,
            load_on_start: true,
        }
    }
}

fn default_max_days() -> u32 {
    MAX_EPG_DAYS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct MiddlewareConfig {
    fixture: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration
    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!("Configuration loaded from {}: {:?}", args.config, settings);

    let middleware: Arc<dyn Middleware> = match args.fixture.or(settings.middleware.fixture) {
        Some(path) => Arc::new(SimulatedMiddleware::from_file(&path)?),
        None => {
            warn!("No middleware fixture configured, starting with an empty middleware");
            Arc::new(SimulatedMiddleware::new(Fixture::default()))
        }
    };

    let mut ip_channels: Vec<IpChannel> = Vec::new();
    for source in &settings.channels.ip_playlist {
        info!("Loading IP channel list from {}...", source);
        match load_ip_playlist(source).await {
            Ok(mut c) => {
                info!("Loaded {} IP channels from {}", c.len(), source);
                ip_channels.append(&mut c);
            }
            Err(e) => {
                error!("Failed to load IP channels from {}: {}", source, e);
            }
        }
    }

    let manager_config = ManagerConfig {
        list_index: args.list_index.unwrap_or(settings.channels.list_index),
        max_days: settings.epg.max_days,
    };
    let manager = Arc::new(DvbManager::initialize(
        middleware,
        IpChannelList::new(ip_channels),
        &manager_config,
    )?);
    info!("Guide date: {}", manager.initial_date()?);

    if settings.epg.reload_on_change {
        manager.watch_epg_changes(Handle::current())?;
    }
    if settings.epg.load_on_start {
        manager.epg().spawn_load(&Handle::current(), DayDelta::Current);
    }

    let app = create_app(manager.clone(), settings.monitoring);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    manager.shutdown()?;
    Ok(())
}
