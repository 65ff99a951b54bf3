use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("empty reading")]
    Empty,
    #[error("reading is not a number: {0}")]
    NotANumber(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalObservation {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

impl SignalObservation {
    pub fn new(value: f64, observed_at: DateTime<Utc>) -> Self {
        Self { value, observed_at }
    }
}

/// Parses a string-encoded reading as delivered by the push feed.
pub fn parse_reading(raw: &str) -> Result<f64, SignalError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SignalError::Empty);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(SignalError::NotANumber(trimmed.to_string())),
    }
}
