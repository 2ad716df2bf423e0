//! Per-entity circuit state machine.

use super::config::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// The state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Records flow through normally
    #[default]
    Closed,
    /// Records for the entity are dropped
    Open,
    /// A limited number of probe records is let through
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name, used for markers and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Returns `true` if `self -> next` is a defined edge.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Closed, Self::Open)
                | (Self::Open, Self::HalfOpen)
                | (Self::HalfOpen, Self::Closed)
                | (Self::HalfOpen, Self::Open)
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before.
    pub from: CircuitState,
    /// State after.
    pub to: CircuitState,
    /// Recovery timeout in effect after the change.
    pub recovery: Duration,
}

/// Whether a record may pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed.
    Admit,
    /// Circuit half-open; the record is a probe.
    Probe,
    /// Circuit open or probe quota used up.
    Reject,
}

impl Admission {
    /// Returns `true` unless rejected.
    #[must_use]
    pub const fn is_admitted(self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// Circuit statistics for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    /// Current state of the circuit
    pub state: CircuitState,
    /// Number of consecutive failures
    pub consecutive_failures: u32,
    /// Failures currently inside the counting window
    pub recent_failures: usize,
    /// Total number of successes
    pub total_successes: u64,
    /// Total number of failures
    pub total_failures: u64,
    /// Records dropped while open
    pub dropped: u64,
    /// Recovery timeout that applies to the next open period, in milliseconds
    pub recovery_ms: u64,
    /// Milliseconds spent in the current state
    pub in_state_ms: u64,
}

/// Circuit of one entity.
#[derive(Debug, Clone)]
pub struct EntityCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    recent_failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    recovery: Duration,
    probes_admitted: u32,
    probe_successes: u32,
    total_successes: u64,
    total_failures: u64,
    dropped: u64,
    last_transition: Instant,
}

impl EntityCircuit {
    /// Creates a closed circuit.
    #[must_use]
    pub fn new(now: Instant, config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            recent_failures: VecDeque::with_capacity(config.failure_threshold as usize),
            opened_at: None,
            recovery: config.base_recovery(),
            probes_admitted: 0,
            probe_successes: 0,
            total_successes: 0,
            total_failures: 0,
            dropped: 0,
            last_transition: now,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// Instant the circuit last opened, if it is open or half-open.
    #[must_use]
    pub const fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Moves an open circuit to half-open once its recovery timer has elapsed.
    pub fn poll_timer(&mut self, now: Instant) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let deadline = self.opened_at? + self.recovery;
        (now >= deadline).then(|| self.transition_to_half_open(now))
    }

    /// Decides whether the next record may pass.
    pub fn try_acquire(&mut self, now: Instant, config: &CircuitBreakerConfig) -> (Admission, Option<Transition>) {
        let transition = self.poll_timer(now);
        let admission = match self.state {
            CircuitState::Closed => Admission::Admit,
            CircuitState::Open => Admission::Reject,
            CircuitState::HalfOpen => {
                if self.probes_admitted < config.half_open_max_probes {
                    self.probes_admitted += 1;
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
        };
        if admission == Admission::Reject {
            self.dropped += 1;
        }
        (admission, transition)
    }

    /// Records a successful admitted record.
    pub fn record_success(&mut self, now: Instant, config: &CircuitBreakerConfig) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.total_successes += 1;

        if self.state == CircuitState::HalfOpen {
            self.probe_successes += 1;
            if self.probe_successes >= config.success_threshold {
                return Some(self.transition_to_closed(now, config));
            }
        }
        None
    }

    /// Records a failed admitted record.
    pub fn record_failure(&mut self, now: Instant, config: &CircuitBreakerConfig) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;

        match self.state {
            CircuitState::Closed => {
                let window = config.window();
                while self
                    .recent_failures
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) >= window)
                {
                    self.recent_failures.pop_front();
                }
                self.recent_failures.push_back(now);
                while self.recent_failures.len() > config.failure_threshold as usize {
                    self.recent_failures.pop_front();
                }
                (self.recent_failures.len() >= config.failure_threshold as usize)
                    .then(|| self.transition_to_open(now))
            }
            CircuitState::HalfOpen => {
                // Back off before the next attempt.
                self.recovery = (self.recovery * 2).min(config.max_recovery());
                Some(self.transition_to_open(now))
            }
            CircuitState::Open => None,
        }
    }

    /// Returns current statistics.
    #[must_use]
    pub fn stats(&self, now: Instant) -> CircuitStats {
        CircuitStats {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            recent_failures: self.recent_failures.len(),
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            dropped: self.dropped,
            recovery_ms: u64::try_from(self.recovery.as_millis()).unwrap_or(u64::MAX),
            in_state_ms: u64::try_from(now.saturating_duration_since(self.last_transition).as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Transition {
        debug_assert!(self.state.can_transition_to(to), "{} -> {to}", self.state);
        let from = self.state;
        self.state = to;
        self.last_transition = now;
        Transition {
            from,
            to,
            recovery: self.recovery,
        }
    }

    fn transition_to_open(&mut self, now: Instant) -> Transition {
        self.opened_at = Some(now);
        self.probes_admitted = 0;
        self.probe_successes = 0;
        self.recent_failures.clear();
        self.transition(CircuitState::Open, now)
    }

    fn transition_to_half_open(&mut self, now: Instant) -> Transition {
        self.probes_admitted = 0;
        self.probe_successes = 0;
        self.consecutive_failures = 0;
        self.transition(CircuitState::HalfOpen, now)
    }

    fn transition_to_closed(&mut self, now: Instant, config: &CircuitBreakerConfig) -> Transition {
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.probes_admitted = 0;
        self.probe_successes = 0;
        self.recovery = config.base_recovery();
        self.transition(CircuitState::Closed, now)
    }
}
