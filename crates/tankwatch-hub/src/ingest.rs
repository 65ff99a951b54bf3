use chrono::{DateTime, Utc};
use tankwatch_core::{parse_reading, SignalObservation};
use tracing::{debug, warn};

/// Filters raw feed deliveries down to readings whose value changed. The feed
/// may re-deliver an unchanged value on refresh, so repeats are dropped here.
#[derive(Debug, Default)]
pub struct SignalIngestor {
    last: Option<f64>,
}

impl SignalIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, raw: &str, now: DateTime<Utc>) -> Option<SignalObservation> {
        let value = match parse_reading(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "signal_invalid", raw = raw, error = %err);
                return None;
            }
        };
        if self.last == Some(value) {
            debug!(event = "signal_repeat", value);
            return None;
        }
        self.last = Some(value);
        Some(SignalObservation::new(value, now))
    }
}
