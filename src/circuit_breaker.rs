use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    failure_threshold: usize,
    cool_down: Duration,
    success_threshold: usize,
    monitoring_period: Duration,
}

impl CircuitBreakerPolicy {
    pub const fn standard() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            success_threshold: 2,
            monitoring_period: Duration::from_secs(60),
        }
    }

    pub const fn failure_threshold(mut self, failure_threshold: usize) -> Self {
        self.failure_threshold = if failure_threshold == 0 {
            1
        } else {
            failure_threshold
        };
        self
    }

    pub const fn cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    pub const fn success_threshold(mut self, success_threshold: usize) -> Self {
        self.success_threshold = if success_threshold == 0 {
            1
        } else {
            success_threshold
        };
        self
    }

    pub fn monitoring_period(mut self, monitoring_period: Duration) -> Self {
        self.monitoring_period = monitoring_period.max(Duration::from_millis(1));
        self
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub recent_failures: usize,
    pub half_open_successes: usize,
    /// Time left before an open breaker admits a probe.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_successes: usize,
    last_failure_at: Option<Instant>,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, monitoring_period: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > monitoring_period {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open_remaining(&self, now: Instant, cool_down: Duration) -> Duration {
        let Some(last_failure_at) = self.last_failure_at else {
            return Duration::ZERO;
        };
        cool_down.saturating_sub(now.saturating_duration_since(last_failure_at))
    }
}

/// Failure detector shared by every request issued through one client.
///
/// The open to half-open transition happens lazily the next time the breaker
/// is consulted; no timer runs in the background.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                last_failure_at: None,
            }),
        }
    }

    pub fn policy(&self) -> CircuitBreakerPolicy {
        self.policy
    }

    pub fn can_proceed(&self) -> bool {
        let now = Instant::now();
        let mut inner = lock_unpoisoned(&self.inner);
        self.refresh(&mut inner, now);
        inner.state != CircuitState::Open
    }

    pub fn status(&self) -> CircuitStatus {
        let now = Instant::now();
        let mut inner = lock_unpoisoned(&self.inner);
        self.refresh(&mut inner, now);
        let retry_after = (inner.state == CircuitState::Open)
            .then(|| inner.open_remaining(now, self.policy.cool_down));
        CircuitStatus {
            state: inner.state,
            recent_failures: inner.failures.len(),
            half_open_successes: inner.half_open_successes,
            retry_after,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.status().state
    }

    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = lock_unpoisoned(&self.inner);
        self.refresh(&mut inner, now);
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes = inner.half_open_successes.saturating_add(1);
            if inner.half_open_successes >= self.policy.success_threshold {
                inner.state = CircuitState::Closed;
                inner.half_open_successes = 0;
                inner.failures.clear();
                info!("circuit breaker closed after successful probes");
            }
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = lock_unpoisoned(&self.inner);
        self.refresh(&mut inner, now);
        inner.last_failure_at = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                if inner.failures.len() >= self.policy.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        failures = inner.failures.len(),
                        cool_down_ms = self.policy.cool_down.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.failures.push_back(now);
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                warn!("circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {
                inner.failures.push_back(now);
            }
        }
    }

    pub fn reset(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.half_open_successes = 0;
        inner.last_failure_at = None;
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        inner.prune(now, self.policy.monitoring_period);
        if inner.state == CircuitState::Open
            && inner.open_remaining(now, self.policy.cool_down).is_zero()
        {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            info!("circuit breaker half-open; admitting probe traffic");
        }
    }
}
