//! Endpoint health tracking with retry backoff.
//!
//! An endpoint is either alive or dead. A failed `open()` marks it dead and
//! records when. While dead, checkouts are refused without touching the
//! network until the retry interval has elapsed; the next checkout after
//! that flips the endpoint back to alive and is allowed to probe it with a
//! fresh connection attempt.

use std::time::{Duration, Instant};

/// Current health of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Alive,
    /// Dead since the recorded instant.
    Dead { since: Instant },
}

/// Alive/dead state machine for a single endpoint.
#[derive(Debug)]
pub struct HealthTracker {
    state: HealthState,
    /// `None` keeps a dead endpoint dead until it is explicitly revived.
    retry_interval: Option<Duration>,
    consecutive_failures: u32,
}

impl HealthTracker {
    pub fn new(retry_interval: Option<Duration>) -> Self {
        Self {
            state: HealthState::Alive,
            retry_interval,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == HealthState::Alive
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval
    }

    pub fn set_retry_interval(&mut self, retry_interval: Option<Duration>) {
        self.retry_interval = retry_interval;
    }

    /// Failed connection attempts since the endpoint was last alive.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decide whether a connection attempt may go ahead at `now`.
    ///
    /// Returns [`Admission::Revived`] when a dead endpoint's retry interval
    /// has elapsed; the tracker is alive again after that call.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            HealthState::Alive => Admission::Alive,
            HealthState::Dead { since } => match self.retry_interval {
                Some(interval) if now.saturating_duration_since(since) >= interval => {
                    self.state = HealthState::Alive;
                    Admission::Revived
                }
                _ => Admission::Refused,
            },
        }
    }

    /// Time left before a dead endpoint may be retried.
    ///
    /// `None` while alive, or when the endpoint only recovers explicitly.
    pub fn retry_in(&self, now: Instant) -> Option<Duration> {
        match self.state {
            HealthState::Alive => None,
            HealthState::Dead { since } => self
                .retry_interval
                .map(|interval| interval.saturating_sub(now.saturating_duration_since(since))),
        }
    }

    /// Record a failed `open()`. Returns `true` if the endpoint was alive.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        let was_alive = self.is_alive();
        self.state = HealthState::Dead { since: now };
        was_alive
    }

    /// Record a successful `open()`.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = HealthState::Alive;
    }

    /// Force the endpoint dead, e.g. after an application-level failure.
    pub fn mark_dead(&mut self, now: Instant) {
        self.state = HealthState::Dead { since: now };
    }

    /// Force the endpoint alive.
    pub fn mark_alive(&mut self) {
        self.consecutive_failures = 0;
        self.state = HealthState::Alive;
    }
}

/// Outcome of [`HealthTracker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Alive,
    /// The endpoint was dead and its retry interval has elapsed.
    Revived,
    /// Still backing off.
    Refused,
}

impl Admission {
    pub fn allowed(self) -> bool {
        !matches!(self, Admission::Refused)
    }
}
