pub mod activity;
pub mod event;
pub mod roster;
pub mod signal;

pub use activity::ActivityState;
pub use event::{MonitorEvent, MonitorRecord, STATUS_EVENT};
pub use roster::{canonical_affiliation, Roster, RosterBuilder, RosterEntry, UNKNOWN_AFFILIATION};
pub use signal::{parse_reading, SignalError, SignalObservation};
