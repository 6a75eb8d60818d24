//! Connection state machine and reconnect policy.

use std::time::Duration;

/// State of the client's single transport connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none wanted.
    Closed,
    /// First connection attempt in progress.
    Connecting { attempt: u32 },
    /// Connected; notices are sent under this client id.
    Open { client_id: String },
    /// Lost or never reached; waiting for or running retry `attempt`.
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open { .. })
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Open { client_id } => Some(client_id),
            _ => None,
        }
    }
}

/// Bounded exponential backoff between reconnect attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay before the first retry. Default: 500ms
    pub initial_delay: Duration,
    /// Upper bound on any delay. Default: 30s
    pub max_delay: Duration,
    /// Growth factor per failed attempt. Default: 2.0
    pub multiplier: f64,
    /// Give up after this many consecutive failures. Default: never
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(millis as u64))
    }
}

/// How a freshly opened connection relates to earlier ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpenKind {
    First,
    /// Something may have been missed; every query must resync.
    Reconnected,
}

/// Outcome of a failed or lost connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backoff {
    Retry(Duration),
    /// Gave up after this many retries; the machine is `Closed`.
    Exhausted { retries: u32 },
}

pub(crate) struct ConnectionMachine {
    state: ConnectionState,
    policy: RetryPolicy,
    failures: u32,
    opened_before: bool,
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Closed,
            policy,
            failures: 0,
            opened_before: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Leave `Closed`. Returns false if a connection is already wanted.
    pub fn start(&mut self) -> bool {
        if self.state != ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Connecting { attempt: 1 };
        true
    }

    pub fn opened(&mut self, client_id: String) -> OpenKind {
        let kind = if self.opened_before || self.failures > 0 {
            OpenKind::Reconnected
        } else {
            OpenKind::First
        };
        self.opened_before = true;
        self.failures = 0;
        self.state = ConnectionState::Open { client_id };
        kind
    }

    /// Record a failed or lost connection.
    ///
    /// Once the policy gives up the machine is back at `Closed` with its
    /// failure count cleared, so the next `start` gets a full set of
    /// retries. Whatever opens next must resync.
    pub fn lost(&mut self) -> Backoff {
        self.failures += 1;
        match self.policy.delay_for(self.failures) {
            Some(delay) => {
                self.state = ConnectionState::Reconnecting {
                    attempt: self.failures,
                };
                Backoff::Retry(delay)
            }
            None => {
                let retries = self.failures - 1;
                self.state = ConnectionState::Closed;
                self.failures = 0;
                self.opened_before = true;
                Backoff::Exhausted { retries }
            }
        }
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.failures = 0;
        self.opened_before = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(350)));
        assert_eq!(policy.delay_for(1000), Some(Duration::from_millis(350)));
    }

    #[test]
    fn test_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        };
        assert!(policy.delay_for(2).is_some());
        assert!(policy.delay_for(3).is_none());
    }

    #[test]
    fn test_machine_transitions() {
        let mut machine = ConnectionMachine::new(RetryPolicy {
            max_attempts: Some(1),
            ..RetryPolicy::default()
        });
        assert!(machine.start());
        assert!(!machine.start());
        assert_eq!(machine.state(), &ConnectionState::Connecting { attempt: 1 });

        assert_eq!(machine.opened("c1".into()), OpenKind::First);
        assert_eq!(machine.state().client_id(), Some("c1"));

        assert!(matches!(machine.lost(), Backoff::Retry(_)));
        assert_eq!(machine.state(), &ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(machine.opened("c2".into()), OpenKind::Reconnected);

        assert!(matches!(machine.lost(), Backoff::Retry(_)));
        assert_eq!(machine.lost(), Backoff::Exhausted { retries: 1 });
        assert_eq!(machine.state(), &ConnectionState::Closed);
    }

    #[test]
    fn test_start_after_exhaustion_gets_full_retries() {
        let mut machine = ConnectionMachine::new(RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        });
        for _ in 0..2 {
            assert!(machine.start());
            assert!(matches!(machine.lost(), Backoff::Retry(_)));
            assert!(matches!(machine.lost(), Backoff::Retry(_)));
            assert_eq!(machine.lost(), Backoff::Exhausted { retries: 2 });
            assert_eq!(machine.state(), &ConnectionState::Closed);
        }

        // Rows held across the outage may be stale
        assert!(machine.start());
        assert_eq!(machine.opened("c1".into()), OpenKind::Reconnected);
    }

    #[test]
    fn test_failed_first_attempt_counts_as_reconnect() {
        let mut machine = ConnectionMachine::new(RetryPolicy::default());
        machine.start();
        machine.lost();
        assert_eq!(machine.opened("c1".into()), OpenKind::Reconnected);

        machine.close();
        machine.start();
        assert_eq!(machine.opened("c2".into()), OpenKind::First);
    }
}
