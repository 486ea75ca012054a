//! Trip switch for the reference-model engine.
//!
//! After `failure_threshold` engine failures in a row the breaker trips and
//! every evaluation fails fast with `CircuitOpen` for `reset_timeout_secs`.
//! When the cool-down ends, a single trial call decides: success re-arms the
//! breaker, failure trips it again with a fresh cool-down.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker position as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Engine failures in a row that trip the breaker
    pub failure_threshold: u32,
    /// Cool-down before the trial call, in seconds
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Armed { failed_in_row: u32 },
    Tripped { until: Instant },
    Trial,
}

#[derive(Debug)]
struct Ledger {
    phase: Phase,
    trips: u64,
    refused: u64,
}

/// Shared by every evaluation task of a validator.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    ledger: Mutex<Ledger>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            ledger: Mutex::new(Ledger {
                phase: Phase::Armed { failed_in_row: 0 },
                trips: 0,
                refused: 0,
            }),
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether an engine call may go out now. An expired cool-down turns this
    /// call into the trial.
    pub fn allow_request(&self) -> bool {
        let mut ledger = self.ledger();
        match ledger.phase {
            Phase::Armed { .. } | Phase::Trial => true,
            Phase::Tripped { until } if Instant::now() >= until => {
                ledger.phase = Phase::Trial;
                true
            }
            Phase::Tripped { .. } => {
                ledger.refused += 1;
                false
            }
        }
    }

    pub fn record_success(&self) {
        self.ledger().phase = Phase::Armed { failed_in_row: 0 };
    }

    pub fn record_failure(&self) {
        let mut ledger = self.ledger();
        let trip = match ledger.phase {
            Phase::Armed { failed_in_row } => {
                let failed_in_row = failed_in_row + 1;
                ledger.phase = Phase::Armed { failed_in_row };
                failed_in_row >= self.config.failure_threshold
            }
            Phase::Trial => true,
            Phase::Tripped { .. } => false,
        };
        if trip {
            ledger.phase = Phase::Tripped {
                until: Instant::now() + self.config.reset_timeout(),
            };
            ledger.trips += 1;
        }
    }

    pub fn state(&self) -> State {
        match self.ledger().phase {
            Phase::Armed { .. } => State::Closed,
            Phase::Tripped { .. } => State::Open,
            Phase::Trial => State::HalfOpen,
        }
    }

    /// Times the breaker has tripped since creation.
    pub fn trips(&self) -> u64 {
        self.ledger().trips
    }

    /// Calls refused while tripped.
    pub fn refused(&self) -> u64 {
        self.ledger().refused
    }
}
