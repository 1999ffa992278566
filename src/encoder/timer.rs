//! Optional wall-clock instrumentation for the encoder.
//!
//! Timers are purely observational. When disabled every entry point is a
//! no-op apart from running the timed closure.

use hashbrown::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct EncoderTimers {
    enabled: bool,
    phases: HashMap<&'static str, Duration>,
    setter_calls: u64,
    setter_time: Duration,
}

impl EncoderTimers {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, ..Default::default() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run `f` and charge its duration to `phase`.
    pub fn time_phase<T>(&mut self, phase: &'static str, f: impl FnOnce(&mut Self) -> T) -> T {
        if !self.enabled {
            return f(self);
        }
        let start = Instant::now();
        let result = f(self);
        *self.phases.entry(phase).or_default() += start.elapsed();
        result
    }

    /// Start timing one setter call.
    pub fn start_setter(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    pub fn stop_setter(&mut self, started: Option<Instant>) {
        if let Some(start) = started {
            self.setter_calls += 1;
            self.setter_time += start.elapsed();
        }
    }

    pub fn report(&self) -> Option<TimingReport> {
        if !self.enabled {
            return None;
        }
        let mut phases: Vec<_> = self.phases.iter().map(|(k, v)| (*k, *v)).collect();
        phases.sort_by_key(|(name, _)| *name);
        Some(TimingReport { phases, setter_calls: self.setter_calls, setter_time: self.setter_time })
    }
}

/// Snapshot of the encoder timers for one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingReport {
    pub phases: Vec<(&'static str, Duration)>,
    pub setter_calls: u64,
    pub setter_time: Duration,
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (phase, time) in &self.phases {
            writeln!(f, "  {:<14} {:.3?}", phase, time)?;
        }
        writeln!(f, "  {:<14} {:.3?} ({} calls)", "field setters", self.setter_time, self.setter_calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_timers_record_nothing() {
        let mut timers = EncoderTimers::new(false);
        let v = timers.time_phase("encode_block", |t| {
            let s = t.start_setter();
            t.stop_setter(s);
            7
        });
        assert_eq!(v, 7);
        assert!(timers.report().is_none());
    }

    #[test]
    fn enabled_timers_count_setters_and_phases() {
        let mut timers = EncoderTimers::new(true);
        timers.time_phase("encode_block", |t| {
            for _ in 0..3 {
                let s = t.start_setter();
                t.stop_setter(s);
            }
        });
        let report = timers.report().unwrap();
        assert_eq!(report.setter_calls, 3);
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].0, "encode_block");
    }
}
