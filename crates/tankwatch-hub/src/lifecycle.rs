use crate::broadcast::{BroadcastHub, HubConfig};
use crate::detector::DetectorSettings;
use crate::feed::{spawn_feed, FeedConfig};
use crate::monitor::{spawn_monitor, MonitorHandle};
use crate::roster::{spawn_roster_poller, RosterSource};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tankwatch_storage::{MemoryStateStore, SqliteStateStore, StateStore, StorageError};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("state store unavailable: {0}")]
    Store(#[from] StorageError),
}

#[derive(Clone)]
pub enum StoreLocation {
    Sqlite(PathBuf),
    Memory(MemoryStateStore),
}

impl StoreLocation {
    fn open(&self) -> Result<Box<dyn StateStore>, StorageError> {
        match self {
            StoreLocation::Sqlite(path) => Ok(Box::new(SqliteStateStore::open(path)?)),
            StoreLocation::Memory(store) => Ok(Box::new(store.clone())),
        }
    }
}

pub struct Services {
    pub store: StoreLocation,
    pub detector: DetectorSettings,
    pub hub: HubConfig,
    pub feed: Option<(FeedConfig, reqwest::Client)>,
    pub roster: Option<Arc<dyn RosterSource>>,
    pub roster_interval: Duration,
}

/// Starts the monitor and its feeders on first use, exactly once.
pub struct Lifecycle {
    services: Services,
    monitor: OnceCell<MonitorHandle>,
}

impl Lifecycle {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            monitor: OnceCell::new(),
        }
    }

    #[cfg(test)]
    pub fn started(&self) -> Option<&MonitorHandle> {
        self.monitor.get()
    }

    /// Safe to call from every request; concurrent first callers wait for a
    /// single start. A failed start is retried by the next caller.
    pub async fn ensure_started(&self) -> Result<&MonitorHandle, StartError> {
        self.monitor.get_or_try_init(|| async { self.start() }).await
    }

    fn start(&self) -> Result<MonitorHandle, StartError> {
        let store = self.services.store.open()?;
        let hub = BroadcastHub::new(self.services.hub.clone());
        let monitor = spawn_monitor(self.services.detector, store, hub);

        if let Some((config, client)) = &self.services.feed {
            info!(event = "feed_start", server = %config.server, item = %config.item);
            spawn_feed(config.clone(), client.clone(), monitor.clone());
        }
        if let Some(source) = &self.services.roster {
            info!(
                event = "roster_poller_start",
                interval_secs = self.services.roster_interval.as_secs()
            );
            spawn_roster_poller(source.clone(), self.services.roster_interval, monitor.clone());
        }
        Ok(monitor)
    }
}
