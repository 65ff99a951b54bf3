use chrono::{DateTime, Utc};
use std::time::Duration;
use tankwatch_core::{ActivityState, MonitorEvent, SignalObservation};
use tracing::{debug, info};

pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_AMBIGUITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub struct DetectorSettings {
    pub activity_timeout: Duration,
    pub ambiguity_timeout: Duration,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            ambiguity_timeout: DEFAULT_AMBIGUITY_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    Activity,
    Ambiguity,
}

/// Identifies one arming of a timer. Re-arming bumps the generation, so a
/// firing that carries an older generation is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Emit(MonitorEvent),
    Persist,
    Arm(TimerToken, Duration),
}

/// Activity start/end state machine over a single monotone-while-active
/// signal. It never reads the clock; callers pass observation and firing
/// times, and schedule the timers it asks for.
#[derive(Debug)]
pub struct ActivityDetector {
    settings: DetectorSettings,
    state: ActivityState,
    level: Option<f64>,
    ambiguity_open: bool,
    activity_generation: u64,
    ambiguity_generation: u64,
}

impl ActivityDetector {
    pub fn new(settings: DetectorSettings, state: ActivityState, level: Option<f64>) -> Self {
        Self {
            settings,
            state,
            level,
            ambiguity_open: false,
            activity_generation: 0,
            ambiguity_generation: 0,
        }
    }

    pub fn state(&self) -> &ActivityState {
        &self.state
    }

    pub fn level(&self) -> Option<f64> {
        self.level
    }

    pub fn ambiguity_open(&self) -> bool {
        self.ambiguity_open
    }

    /// Arms the activity timer for an episode restored from storage, so it
    /// ends unless a rise arrives within the timeout.
    pub fn resume(&mut self) -> Vec<Effect> {
        if !self.state.is_active() {
            return Vec::new();
        }
        vec![Effect::Arm(self.rearm(TimerKind::Activity), self.settings.activity_timeout)]
    }

    pub fn on_sample(&mut self, sample: SignalObservation) -> Vec<Effect> {
        let previous = self.level;
        if previous == Some(sample.value) {
            return Vec::new();
        }
        self.level = Some(sample.value);

        let mut effects = vec![Effect::Emit(MonitorEvent::LevelUpdate {
            level: sample.value,
        })];

        let Some(previous) = previous else {
            debug!(event = "signal_baseline", level = sample.value);
            effects.push(Effect::Persist);
            return effects;
        };

        if sample.value > previous {
            if self.ambiguity_open {
                debug!(event = "ambiguity_closed", reason = "rise", level = sample.value);
            }
            self.ambiguity_open = false;
            self.ambiguity_generation += 1;

            if self.state.begin(sample.observed_at) {
                info!(
                    event = "activity_start",
                    started_at = %sample.observed_at,
                    level = sample.value
                );
                effects.push(Effect::Emit(MonitorEvent::ActivityStart {
                    started_at: sample.observed_at,
                    level: sample.value,
                }));
            }
            let token = self.rearm(TimerKind::Activity);
            effects.push(Effect::Arm(token, self.settings.activity_timeout));
        } else {
            // A lower reading may still be an understated read of a level
            // that is rising; it is only trusted once the window lapses.
            self.ambiguity_open = true;
            debug!(event = "ambiguity_opened", previous, level = sample.value);
            let token = self.rearm(TimerKind::Ambiguity);
            effects.push(Effect::Arm(token, self.settings.ambiguity_timeout));
        }

        effects.push(Effect::Persist);
        effects
    }

    pub fn on_timer(&mut self, token: TimerToken, now: DateTime<Utc>) -> Vec<Effect> {
        if token.generation != self.generation(token.kind) {
            debug!(event = "timer_stale", kind = ?token.kind, generation = token.generation);
            return Vec::new();
        }
        match token.kind {
            TimerKind::Activity => {
                let Some(started_at) = self.state.end(now) else {
                    return Vec::new();
                };
                info!(event = "activity_end", started_at = %started_at, ended_at = %now);
                vec![
                    Effect::Emit(MonitorEvent::ActivityEnd {
                        ended_at: now,
                        started_at: Some(started_at),
                        level: self.level,
                    }),
                    Effect::Persist,
                ]
            }
            TimerKind::Ambiguity => {
                if self.ambiguity_open {
                    debug!(event = "ambiguity_closed", reason = "timeout");
                }
                self.ambiguity_open = false;
                Vec::new()
            }
        }
    }

    fn generation(&self, kind: TimerKind) -> u64 {
        match kind {
            TimerKind::Activity => self.activity_generation,
            TimerKind::Ambiguity => self.ambiguity_generation,
        }
    }

    fn rearm(&mut self, kind: TimerKind) -> TimerToken {
        let generation = match kind {
            TimerKind::Activity => {
                self.activity_generation += 1;
                self.activity_generation
            }
            TimerKind::Ambiguity => {
                self.ambiguity_generation += 1;
                self.ambiguity_generation
            }
        };
        TimerToken { kind, generation }
    }
}
