mod api;
mod broadcast;
mod detector;
mod feed;
mod ingest;
mod lifecycle;
mod logging;
mod monitor;
mod roster;

use broadcast::HubConfig;
use clap::Parser;
use detector::DetectorSettings;
use feed::FeedConfig;
use lifecycle::{Lifecycle, Services, StoreLocation};
use roster::{HttpRosterSource, RosterSource};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tankwatch_storage::MemoryStateStore;
use tracing::{error, info, warn};
use url::Url;

const DEFAULT_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_DB_PATH: &str = ".tankwatch/state.db";
const MEMORY_DB_PATH: &str = ":memory:";
const USER_AGENT: &str = concat!("tankwatch-hub/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: String,
    feed: Option<FeedConfig>,
    roster_url: String,
    roster_interval: Duration,
    detector: DetectorSettings,
    hub: HubConfig,
    http_timeout: Duration,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "tankwatch-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db_path: String,
    #[arg(long, default_value = "")]
    feed_server: String,
    #[arg(long, default_value = feed::DEFAULT_ADAPTER_SET)]
    adapter_set: String,
    #[arg(long, default_value = feed::DEFAULT_ITEM)]
    item: String,
    #[arg(long, default_value_t = false)]
    no_feed: bool,
    #[arg(long, default_value = "")]
    roster_url: String,
    #[arg(long, default_value_t = roster::DEFAULT_ROSTER_INTERVAL.as_secs())]
    roster_interval: u64,
    #[arg(long, default_value_t = detector::DEFAULT_ACTIVITY_TIMEOUT.as_secs())]
    activity_timeout: u64,
    #[arg(long, default_value_t = detector::DEFAULT_AMBIGUITY_TIMEOUT.as_secs())]
    ambiguity_timeout: u64,
    #[arg(long, default_value_t = broadcast::DEFAULT_KEEPALIVE_INTERVAL.as_secs())]
    keepalive_interval: u64,
    #[arg(long, default_value_t = broadcast::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 15)]
    http_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err}");
            return;
        }
    };
    let log_dir = Some(config.log_dir.trim())
        .filter(|dir| !dir.is_empty())
        .map(Path::new);
    let _log_guard = logging::init_logging(config.debug, log_dir);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let services = match build_services(&config) {
        Ok(services) => services,
        Err(err) => {
            error!(event = "http_client_error", error = %err);
            return;
        }
    };
    let lifecycle = Arc::new(Lifecycle::new(services));
    let app = api::router(lifecycle);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        db_path = %config.db_path,
        feed = config.feed.is_some()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn load_config() -> Result<Config, String> {
    let args = Args::parse();
    let feed = if args.no_feed {
        None
    } else {
        let server = resolve_flag(
            &args.feed_server,
            "TANKWATCH_FEED_SERVER",
            feed::DEFAULT_FEED_SERVER,
        );
        let server =
            Url::parse(&server).map_err(|err| format!("invalid feed server {server}: {err}"))?;
        Some(FeedConfig {
            server,
            adapter_set: args.adapter_set.clone(),
            item: args.item.clone(),
        })
    };
    Ok(Config {
        addr: resolve_flag(&args.addr, "TANKWATCH_ADDR", DEFAULT_ADDR),
        db_path: resolve_flag(&args.db_path, "TANKWATCH_DB", DEFAULT_DB_PATH),
        feed,
        roster_url: resolve_flag(
            &args.roster_url,
            "TANKWATCH_ROSTER_URL",
            roster::DEFAULT_ROSTER_URL,
        ),
        roster_interval: Duration::from_secs(args.roster_interval.max(1)),
        detector: DetectorSettings {
            activity_timeout: Duration::from_secs(args.activity_timeout),
            ambiguity_timeout: Duration::from_secs(args.ambiguity_timeout),
        },
        hub: HubConfig {
            keepalive_interval: Duration::from_secs(args.keepalive_interval),
            queue_capacity: args.queue_capacity,
        },
        http_timeout: Duration::from_secs(args.http_timeout),
        debug: args.debug || env_flag("TANKWATCH_DEBUG"),
        log_dir: resolve_flag(&args.log_dir, "TANKWATCH_LOG_DIR", ""),
    })
}

fn build_services(config: &Config) -> Result<Services, reqwest::Error> {
    let store = if config.db_path == MEMORY_DB_PATH {
        warn!(event = "memory_store", reason = "state is not persisted across restarts");
        StoreLocation::Memory(MemoryStateStore::new())
    } else {
        StoreLocation::Sqlite(PathBuf::from(&config.db_path))
    };

    let roster_client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.http_timeout)
        .build()?;
    let roster: Arc<dyn RosterSource> =
        Arc::new(HttpRosterSource::new(roster_client, config.roster_url.clone()));

    // The stream connection lives for the whole session, so only connecting
    // is bounded here.
    let feed = match &config.feed {
        Some(feed_config) => {
            let client = reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(config.http_timeout)
                .build()?;
            Some((feed_config.clone(), client))
        }
        None => None,
    };

    Ok(Services {
        store,
        detector: config.detector,
        hub: config.hub.clone(),
        feed,
        roster: Some(roster),
        roster_interval: config.roster_interval,
    })
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Flag wins, then a non-blank environment variable, then the default.
fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}
