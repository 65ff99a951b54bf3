use crate::activity::ActivityState;
use crate::roster::Roster;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_EVENT: &str = "status";

/// The persisted record and the snapshot document served to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRecord {
    #[serde(flatten)]
    pub activity: ActivityState,
    #[serde(default)]
    pub level: Option<f64>,
    #[serde(default)]
    pub roster: Roster,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    ActivityStart {
        started_at: DateTime<Utc>,
        level: f64,
    },
    ActivityEnd {
        ended_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        level: Option<f64>,
    },
    LevelUpdate {
        level: f64,
    },
    RosterChanged {
        roster: Roster,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivityStartPayload {
    started_at: DateTime<Utc>,
    level: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivityEndPayload {
    ended_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    level: Option<f64>,
}

#[derive(Serialize)]
struct LevelUpdatePayload {
    level: f64,
}

#[derive(Serialize)]
struct RosterChangedPayload<'a> {
    roster: &'a Roster,
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::ActivityStart { .. } => "activityStart",
            MonitorEvent::ActivityEnd { .. } => "activityEnd",
            MonitorEvent::LevelUpdate { .. } => "levelUpdate",
            MonitorEvent::RosterChanged { .. } => "rosterChanged",
        }
    }

    pub fn data(&self) -> serde_json::Result<String> {
        match self {
            MonitorEvent::ActivityStart { started_at, level } => {
                serde_json::to_string(&ActivityStartPayload {
                    started_at: *started_at,
                    level: *level,
                })
            }
            MonitorEvent::ActivityEnd {
                ended_at,
                started_at,
                level,
            } => serde_json::to_string(&ActivityEndPayload {
                ended_at: *ended_at,
                started_at: *started_at,
                level: *level,
            }),
            MonitorEvent::LevelUpdate { level } => {
                serde_json::to_string(&LevelUpdatePayload { level: *level })
            }
            MonitorEvent::RosterChanged { roster } => {
                serde_json::to_string(&RosterChangedPayload { roster })
            }
        }
    }
}
