use crate::broadcast::{BroadcastHub, Subscription};
use crate::detector::{ActivityDetector, DetectorSettings, Effect, TimerToken};
use chrono::Utc;
use std::sync::Arc;
use tankwatch_core::{MonitorEvent, MonitorRecord, Roster, SignalObservation};
use tankwatch_storage::StateStore;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const MAILBOX_CAPACITY: usize = 256;

enum Command {
    Sample(SignalObservation),
    Roster(Roster),
    Timer(TimerToken),
    Snapshot(oneshot::Sender<MonitorRecord>),
    Attach(oneshot::Sender<Option<Subscription>>),
}

/// Cloneable entry point to the monitor task. Every method returns a falsy
/// value once the task is gone.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<Command>,
}

impl MonitorHandle {
    pub async fn submit_sample(&self, sample: SignalObservation) -> bool {
        self.tx.send(Command::Sample(sample)).await.is_ok()
    }

    pub async fn submit_roster(&self, roster: Roster) -> bool {
        self.tx.send(Command::Roster(roster)).await.is_ok()
    }

    pub async fn snapshot(&self) -> Option<MonitorRecord> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Snapshot(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Attaches a live stream. The snapshot frame is queued before any event
    /// the monitor emits afterwards.
    pub async fn attach(&self) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Attach(reply)).await.ok()?;
        rx.await.ok().flatten()
    }

    #[cfg(test)]
    pub fn same_monitor(&self, other: &MonitorHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Owns activity state, roster and the store. All mutation happens on the
/// single task running [`Monitor::run`].
struct Monitor {
    detector: ActivityDetector,
    roster: Roster,
    store: Box<dyn StateStore>,
    hub: Arc<BroadcastHub>,
    mailbox: mpsc::Receiver<Command>,
    timers: mpsc::WeakSender<Command>,
    dirty: bool,
}

pub fn spawn_monitor(
    settings: DetectorSettings,
    store: Box<dyn StateStore>,
    hub: Arc<BroadcastHub>,
) -> MonitorHandle {
    let record = match store.load() {
        Ok(Some(record)) => {
            info!(
                event = "state_restored",
                is_active = record.activity.is_active(),
                level = ?record.level,
                roster = record.roster.len()
            );
            record
        }
        Ok(None) => MonitorRecord::default(),
        Err(err) => {
            warn!(event = "state_load_error", error = %err);
            MonitorRecord::default()
        }
    };

    let (tx, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
    let monitor = Monitor {
        detector: ActivityDetector::new(settings, record.activity, record.level),
        roster: record.roster,
        store,
        hub,
        mailbox,
        timers: tx.downgrade(),
        dirty: false,
    };
    tokio::spawn(monitor.run());
    MonitorHandle { tx }
}

impl Monitor {
    async fn run(mut self) {
        let effects = self.detector.resume();
        self.apply(effects);
        info!(
            event = "monitor_start",
            is_active = self.detector.state().is_active()
        );

        while let Some(command) = self.mailbox.recv().await {
            self.handle(command);
            if self.dirty {
                self.flush();
            }
        }
        info!(
            event = "monitor_stop",
            is_active = self.detector.state().is_active(),
            ambiguity_open = self.detector.ambiguity_open()
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Sample(sample) => {
                let effects = self.detector.on_sample(sample);
                self.apply(effects);
            }
            Command::Timer(token) => {
                let effects = self.detector.on_timer(token, Utc::now());
                self.apply(effects);
            }
            Command::Roster(roster) => self.update_roster(roster),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.record());
            }
            Command::Attach(reply) => {
                let subscription = match self.hub.attach(&self.record()) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(event = "snapshot_encode_error", error = %err);
                        None
                    }
                };
                let _ = reply.send(subscription);
            }
        }
    }

    fn update_roster(&mut self, roster: Roster) {
        if roster.same_members(&self.roster) {
            debug!(event = "roster_unchanged", members = roster.len());
            return;
        }
        info!(event = "roster_changed", members = roster.len());
        self.roster = roster;
        self.hub.emit(&MonitorEvent::RosterChanged {
            roster: self.roster.clone(),
        });
        self.dirty = true;
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => {
                    self.hub.emit(&event);
                }
                Effect::Persist => self.dirty = true,
                Effect::Arm(token, after) => self.arm(token, after),
            }
        }
    }

    fn arm(&self, token: TimerToken, after: std::time::Duration) {
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = timers.upgrade() {
                let _ = tx.send(Command::Timer(token)).await;
            }
        });
    }

    fn record(&self) -> MonitorRecord {
        MonitorRecord {
            activity: self.detector.state().clone(),
            level: self.detector.level(),
            roster: self.roster.clone(),
        }
    }

    /// Writes the whole record; on failure it stays dirty and the next
    /// processed command retries.
    fn flush(&mut self) {
        match self.store.save(&self.record()) {
            Ok(()) => self.dirty = false,
            Err(err) => warn!(event = "store_save_error", error = %err),
        }
    }
}
