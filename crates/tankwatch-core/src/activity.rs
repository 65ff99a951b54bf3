use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity episode state. `current_started_at` is set exactly while the
/// episode is active; the constructors and transitions keep that invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ActivityStateRecord", rename_all = "camelCase")]
pub struct ActivityState {
    is_active: bool,
    last_ended_at: Option<DateTime<Utc>>,
    current_started_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityStateRecord {
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    last_ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    current_started_at: Option<DateTime<Utc>>,
}

impl From<ActivityStateRecord> for ActivityState {
    fn from(record: ActivityStateRecord) -> Self {
        // An active flag without a start time cannot be resumed faithfully.
        let current_started_at = if record.is_active {
            record.current_started_at
        } else {
            None
        };
        Self {
            is_active: current_started_at.is_some(),
            last_ended_at: record.last_ended_at,
            current_started_at,
        }
    }
}

impl ActivityState {
    pub fn idle(last_ended_at: Option<DateTime<Utc>>) -> Self {
        Self {
            is_active: false,
            last_ended_at,
            current_started_at: None,
        }
    }

    pub fn active(started_at: DateTime<Utc>, last_ended_at: Option<DateTime<Utc>>) -> Self {
        Self {
            is_active: true,
            last_ended_at,
            current_started_at: Some(started_at),
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn last_ended_at(&self) -> Option<DateTime<Utc>> {
        self.last_ended_at
    }

    pub fn current_started_at(&self) -> Option<DateTime<Utc>> {
        self.current_started_at
    }

    /// Enters the active state. Returns false when an episode is already open.
    pub fn begin(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_active {
            return false;
        }
        self.is_active = true;
        self.current_started_at = Some(now);
        true
    }

    /// Closes the open episode and returns its start time, or `None` when idle.
    pub fn end(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_active {
            return None;
        }
        self.is_active = false;
        self.last_ended_at = Some(now);
        self.current_started_at.take()
    }
}
