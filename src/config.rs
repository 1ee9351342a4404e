use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::rate_limit::{RateLimitPolicy, ResetInterpretation};
use crate::retry::RetryPolicy;

/// Connector configuration as loaded by the host, e.g. from a JSON or TOML
/// file. Durations are expressed in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,

    #[serde(default)]
    pub default_query: BTreeMap<String, String>,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Absent disables client-side rate limiting.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Absent disables the circuit breaker.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout_ms: default_request_timeout_ms(),
            default_headers: BTreeMap::new(),
            default_query: BTreeMap::new(),
            retry: RetryConfig::default(),
            rate_limit: None,
            circuit_breaker: None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: Vec<u16>,
    pub respect_retry_after: bool,
    /// `None` means no wall-clock limit.
    pub retry_budget_ms: Option<u64>,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            retryable_status_codes: vec![408, 425, 429, 500, 502, 503, 504],
            respect_retry_after: true,
            retry_budget_ms: Some(60_000),
            jitter: true,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let policy = RetryPolicy::standard()
            .max_attempts(config.max_attempts)
            .initial_delay(Duration::from_millis(config.initial_delay_ms))
            .max_delay(Duration::from_millis(config.max_delay_ms))
            .backoff_multiplier(config.backoff_multiplier)
            .retryable_status_codes(config.retryable_status_codes.iter().copied())
            .respect_retry_after(config.respect_retry_after)
            .jitter(config.jitter);
        match config.retry_budget_ms {
            Some(budget_ms) => policy.retry_budget(Duration::from_millis(budget_ms)),
            None => policy.unlimited_retry_budget(),
        }
    }
}

/// How the `reset` quota header is read; see [`ResetInterpretation`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    #[default]
    Auto,
    EpochSeconds,
    RelativeSeconds,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst_capacity: usize,
    pub adaptive_from_headers: bool,
    pub reset_mode: ResetMode,
    /// Only used by `ResetMode::Auto`.
    pub epoch_threshold_secs: f64,
    pub max_cooldown_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_capacity: 10,
            adaptive_from_headers: true,
            reset_mode: ResetMode::Auto,
            epoch_threshold_secs: 1_000_000_000.0,
            max_cooldown_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl From<&RateLimitConfig> for RateLimitPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        let reset_interpretation = match config.reset_mode {
            ResetMode::Auto => ResetInterpretation::Auto {
                epoch_threshold_secs: config.epoch_threshold_secs,
            },
            ResetMode::EpochSeconds => ResetInterpretation::EpochSeconds,
            ResetMode::RelativeSeconds => ResetInterpretation::RelativeSeconds,
        };
        RateLimitPolicy::standard()
            .requests_per_second(config.requests_per_second)
            .burst_capacity(config.burst_capacity)
            .adaptive_from_headers(config.adaptive_from_headers)
            .reset_interpretation(reset_interpretation)
            .max_cooldown(Duration::from_millis(config.max_cooldown_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub cool_down_ms: u64,
    pub success_threshold: usize,
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down_ms: 30_000,
            success_threshold: 2,
            monitoring_period_ms: 60_000,
        }
    }
}

impl From<&CircuitBreakerConfig> for CircuitBreakerPolicy {
    fn from(config: &CircuitBreakerConfig) -> Self {
        CircuitBreakerPolicy::standard()
            .failure_threshold(config.failure_threshold)
            .cool_down(Duration::from_millis(config.cool_down_ms))
            .success_threshold(config.success_threshold)
            .monitoring_period(Duration::from_millis(config.monitoring_period_ms))
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}
