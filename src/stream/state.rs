// Connection state machine
//
// The reconnect loop in `connection.rs` drives these transitions; keeping
// them pure means backoff arithmetic and the "probe failure always forces a
// reconnect" rule can be tested without a network.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started, or stopped by `disconnect()`.
    Idle,
    /// A stream request is in flight.
    Connecting,
    /// The stream is open and being read.
    Connected,
    /// Waiting before reconnect attempt number `attempt` (1-based).
    Backoff { attempt: u32 },
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    ConnectRequested,
    Opened,
    /// Stream request failed, or an open stream ended (error or EOF).
    Failed,
    /// Keepalive probe failed.
    ProbeFailed,
    /// The backoff delay elapsed.
    RetryDue,
    Stopped,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Next state for `input`. Returns `self` unchanged for inputs that do
    /// not apply in the current state.
    pub fn next(self, input: ConnectionInput) -> ConnectionState {
        use ConnectionInput::*;
        use ConnectionState::*;

        match (self, input) {
            (_, Stopped) => Idle,
            (Idle, ConnectRequested) => Connecting,
            (Connecting, Opened) => Connected,
            // A successful open resets the attempt counter: the first retry
            // after a healthy connection waits the base delay.
            (Connected, Failed) | (Connected, ProbeFailed) => Backoff { attempt: 1 },
            // A probe failure aborts whatever is in flight, whatever we
            // believed about the connection.
            (Connecting, ProbeFailed) => Backoff { attempt: 1 },
            (Connecting, Failed) => Backoff { attempt: 1 },
            (Backoff { .. }, RetryDue) => Connecting,
            (state, _) => state,
        }
    }

    /// Like `next`, but when a connection attempt fails right after a
    /// backoff the attempt number keeps growing.
    pub fn next_after_attempt(self, input: ConnectionInput, previous_attempt: u32) -> ConnectionState {
        match (self, input) {
            (ConnectionState::Connecting, ConnectionInput::Failed) if previous_attempt > 0 => {
                ConnectionState::Backoff {
                    attempt: previous_attempt.saturating_add(1),
                }
            }
            _ => self.next(input),
        }
    }
}

/// Exponential reconnect delays: `min(base · multiplier^(n-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            base,
            max,
            multiplier: multiplier.max(1),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
            config.reconnect_multiplier,
        )
    }

    /// Delay before attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let factor = (self.multiplier as u64).checked_pow(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionInput::*;
    use ConnectionState::*;
    use ConnectionState::Backoff;

    #[test]
    fn test_backoff_sequence() {
        let backoff = super::Backoff::default();
        let delays: Vec<u64> = (1..=8)
            .map(|n| backoff.delay(n).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            [1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn test_backoff_huge_attempt_saturates_at_max() {
        let backoff = super::Backoff::default();
        assert_eq!(backoff.delay(10_000), Duration::from_millis(30_000));
        assert_eq!(backoff.delay(0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_multiplier_one_is_constant() {
        let backoff = super::Backoff::new(Duration::from_millis(500), Duration::from_secs(5), 1);
        assert_eq!(backoff.delay(1), backoff.delay(7));
    }

    #[test]
    fn test_happy_path() {
        let state = Idle.next(ConnectRequested);
        assert_eq!(state, Connecting);
        let state = state.next(Opened);
        assert!(state.is_connected());
    }

    #[test]
    fn test_probe_failure_forces_reconnect_from_connected() {
        assert_eq!(Connected.next(ProbeFailed), Backoff { attempt: 1 });
    }

    #[test]
    fn test_probe_failure_while_connecting_also_backs_off() {
        assert_eq!(Connecting.next(ProbeFailed), Backoff { attempt: 1 });
    }

    #[test]
    fn test_stream_end_after_success_resets_to_base() {
        // Even after many failed attempts, one good connection resets backoff.
        let state = Backoff { attempt: 6 }.next(RetryDue);
        let state = state.next(Opened);
        assert_eq!(state.next(Failed), Backoff { attempt: 1 });
    }

    #[test]
    fn test_repeated_connect_failures_grow_attempt() {
        let state = Backoff { attempt: 3 }.next(RetryDue);
        assert_eq!(state, Connecting);
        assert_eq!(state.next_after_attempt(Failed, 3), Backoff { attempt: 4 });
    }

    #[test]
    fn test_stop_from_any_state() {
        for state in [Idle, Connecting, Connected, Backoff { attempt: 2 }] {
            assert_eq!(state.next(Stopped), Idle);
        }
    }

    #[test]
    fn test_irrelevant_inputs_are_ignored() {
        assert_eq!(Idle.next(Opened), Idle);
        assert_eq!(Connected.next(RetryDue), Connected);
    }
}
