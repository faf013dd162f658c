//! Poll timers.
//!
//! One repeating timer per scope. The schedule itself never sleeps; the
//! manager asks it for the earliest deadline, sleeps until then, and collects
//! the scopes that are due. A scope whose previous request is still in flight
//! is never due, so at most one request per scope is outstanding.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::ScopeKey;

#[derive(Debug, Clone, Copy)]
struct PollTimer {
    interval: Duration,
    next_due: Instant,
    in_flight: bool,
}

/// Repeating poll timers keyed by scope.
#[derive(Debug, Default)]
pub struct PollSchedule {
    timers: HashMap<ScopeKey, PollTimer>,
}

impl PollSchedule {
    /// Create an empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start polling `scope` every `interval`, first cycle due immediately.
    ///
    /// Restarting a running scope keeps its in-flight flag.
    pub fn start(&mut self, scope: ScopeKey, interval: Duration, now: Instant) {
        let interval = interval.max(Duration::from_millis(1));
        self.timers
            .entry(scope)
            .and_modify(|timer| {
                timer.interval = interval;
                timer.next_due = now;
            })
            .or_insert(PollTimer {
                interval,
                next_due: now,
                in_flight: false,
            });
    }

    /// Stop polling `scope`. Returns `false` if it was not running.
    pub fn stop(&mut self, scope: &ScopeKey) -> bool {
        self.timers.remove(scope).is_some()
    }

    /// Stop every timer.
    pub fn stop_all(&mut self) {
        self.timers.clear();
    }

    /// Whether `scope` has a running timer.
    pub fn is_running(&self, scope: &ScopeKey) -> bool {
        self.timers.contains_key(scope)
    }

    /// Whether any timer is running.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest deadline among scopes without a request in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .values()
            .filter(|timer| !timer.in_flight)
            .map(|timer| timer.next_due)
            .min()
    }

    /// Collect every scope due at `now` and mark it in flight.
    ///
    /// The next cycle is scheduled one interval after the previous deadline,
    /// or one interval from `now` if the schedule fell behind.
    pub fn take_due(&mut self, now: Instant) -> Vec<ScopeKey> {
        let mut due: Vec<ScopeKey> = self
            .timers
            .iter_mut()
            .filter(|(_, timer)| !timer.in_flight && timer.next_due <= now)
            .map(|(scope, timer)| {
                timer.in_flight = true;
                let next = timer.next_due + timer.interval;
                timer.next_due = if next <= now { now + timer.interval } else { next };
                scope.clone()
            })
            .collect();
        due.sort();
        due
    }

    /// Mark the request for `scope` as finished.
    pub fn complete(&mut self, scope: &ScopeKey) {
        if let Some(timer) = self.timers.get_mut(scope) {
            timer.in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(channel: &str) -> ScopeKey {
        ScopeKey::new("u1", "s1", channel)
    }

    const RATE: Duration = Duration::from_millis(2000);

    #[test]
    fn test_first_cycle_is_immediate() {
        let now = Instant::now();
        let mut schedule = PollSchedule::new();
        schedule.start(scope("c1"), RATE, now);

        assert_eq!(schedule.next_deadline(), Some(now));
        assert_eq!(schedule.take_due(now), vec![scope("c1")]);
    }

    #[test]
    fn test_in_flight_scope_is_skipped() {
        let now = Instant::now();
        let mut schedule = PollSchedule::new();
        schedule.start(scope("c1"), RATE, now);
        schedule.take_due(now);

        // request still outstanding two intervals later
        let later = now + RATE * 2;
        assert!(schedule.next_deadline().is_none());
        assert!(schedule.take_due(later).is_empty());

        schedule.complete(&scope("c1"));
        assert_eq!(schedule.next_deadline(), Some(now + RATE));
        assert_eq!(schedule.take_due(later), vec![scope("c1")]);
        assert_eq!(schedule.next_deadline(), None);
        schedule.complete(&scope("c1"));
        assert_eq!(schedule.next_deadline(), Some(later + RATE));
    }

    #[test]
    fn test_fixed_rate() {
        let now = Instant::now();
        let mut schedule = PollSchedule::new();
        schedule.start(scope("c1"), RATE, now);

        for cycle in 0..4u32 {
            let at = now + RATE * cycle;
            assert_eq!(schedule.take_due(at), vec![scope("c1")]);
            schedule.complete(&scope("c1"));
            assert_eq!(schedule.next_deadline(), Some(at + RATE));
        }
    }

    #[test]
    fn test_stop() {
        let now = Instant::now();
        let mut schedule = PollSchedule::new();
        assert!(!schedule.stop(&scope("c1")));

        schedule.start(scope("c1"), RATE, now);
        schedule.start(scope("c2"), RATE, now);
        assert!(schedule.stop(&scope("c1")));
        assert!(!schedule.is_running(&scope("c1")));
        assert_eq!(schedule.take_due(now), vec![scope("c2")]);

        schedule.stop_all();
        assert!(schedule.is_empty());
        assert!(schedule.next_deadline().is_none());
    }
}
