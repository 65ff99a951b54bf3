use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};
use tankwatch_core::{MonitorEvent, MonitorRecord, STATUS_EVENT};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub keepalive_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubFrame {
    Event { name: &'static str, data: Arc<str> },
    KeepAlive,
}

/// Fan-out of monitor events to attached live streams. A subscriber whose
/// queue is closed or full is dropped on the spot; other subscribers are
/// unaffected.
pub struct BroadcastHub {
    config: HubConfig,
    conn_counter: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<HubFrame>>>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            conn_counter: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<HubFrame>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new stream whose first frame is the given snapshot. Must be
    /// called from within a tokio runtime.
    pub fn attach(self: &Arc<Self>, snapshot: &MonitorRecord) -> serde_json::Result<Subscription> {
        let data: Arc<str> = serde_json::to_string(snapshot)?.into();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut subscribers = self.subscribers();
            let _ = tx.try_send(HubFrame::Event {
                name: STATUS_EVENT,
                data,
            });
            subscribers.insert(conn_id, tx);
            info!(
                event = "subscriber_attached",
                conn_id,
                subscribers = subscribers.len()
            );
        }
        self.spawn_keepalive(conn_id);
        Ok(Subscription {
            conn_id,
            frames: rx,
            _guard: DetachGuard {
                conn_id,
                hub: Arc::downgrade(self),
            },
        })
    }

    /// Sends the event to every attached stream and returns how many accepted it.
    pub fn emit(&self, event: &MonitorEvent) -> usize {
        let data: Arc<str> = match event.data() {
            Ok(value) => value.into(),
            Err(err) => {
                warn!(event = "event_encode_error", name = event.name(), error = %err);
                return 0;
            }
        };
        self.broadcast(HubFrame::Event {
            name: event.name(),
            data,
        })
    }

    fn broadcast(&self, frame: HubFrame) -> usize {
        let mut subscribers = self.subscribers();
        let mut failed = Vec::new();
        for (conn_id, sender) in subscribers.iter() {
            if sender.try_send(frame.clone()).is_err() {
                failed.push(*conn_id);
            }
        }
        for conn_id in &failed {
            subscribers.remove(conn_id);
            debug!(event = "subscriber_removed", conn_id, reason = "send_error");
        }
        subscribers.len()
    }

    pub fn detach(&self, conn_id: u64, reason: &str) -> bool {
        let removed = self.subscribers().remove(&conn_id).is_some();
        if removed {
            debug!(event = "subscriber_removed", conn_id, reason = reason);
        }
        removed
    }

    fn keepalive(&self, conn_id: u64) -> bool {
        let mut subscribers = self.subscribers();
        let Some(sender) = subscribers.get(&conn_id) else {
            return false;
        };
        if sender.try_send(HubFrame::KeepAlive).is_err() {
            subscribers.remove(&conn_id);
            debug!(event = "subscriber_removed", conn_id, reason = "keepalive_failed");
            return false;
        }
        true
    }

    fn spawn_keepalive(self: &Arc<Self>, conn_id: u64) {
        let interval = self.config.keepalive_interval;
        if interval.is_zero() {
            return;
        }
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                if !hub.keepalive(conn_id) {
                    return;
                }
            }
        });
    }
}

/// One attached live stream. Dropping it detaches the subscriber.
pub struct Subscription {
    conn_id: u64,
    frames: mpsc::Receiver<HubFrame>,
    _guard: DetachGuard,
}

impl Subscription {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Next frame, or `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<HubFrame> {
        self.frames.recv().await
    }
}

struct DetachGuard {
    conn_id: u64,
    hub: Weak<BroadcastHub>,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.detach(self.conn_id, "disconnect");
        }
    }
}
