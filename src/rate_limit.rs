use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::util::{epoch_seconds, header_str, lock_unpoisoned, parse_retry_after};

const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
// 2001-09-09T01:46:40Z. Smaller reset values are read as relative seconds.
const DEFAULT_EPOCH_THRESHOLD_SECS: f64 = 1_000_000_000.0;

/// How a rate-limit `reset` header value is read.
///
/// Providers disagree on whether `reset` carries an absolute epoch timestamp
/// or a number of seconds until the window resets. `Auto` guesses from the
/// magnitude: values at or above `epoch_threshold_secs` are epoch seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResetInterpretation {
    Auto { epoch_threshold_secs: f64 },
    EpochSeconds,
    RelativeSeconds,
}

impl Default for ResetInterpretation {
    fn default() -> Self {
        Self::Auto {
            epoch_threshold_secs: DEFAULT_EPOCH_THRESHOLD_SECS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitPolicy {
    requests_per_second: f64,
    burst_capacity: usize,
    adaptive_from_headers: bool,
    max_cooldown: Duration,
    reset_interpretation: ResetInterpretation,
    poll_interval: Duration,
}

impl RateLimitPolicy {
    pub const fn standard() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_capacity: 10,
            adaptive_from_headers: true,
            max_cooldown: DEFAULT_MAX_COOLDOWN,
            reset_interpretation: ResetInterpretation::Auto {
                epoch_threshold_secs: DEFAULT_EPOCH_THRESHOLD_SECS,
            },
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn requests_per_second(mut self, requests_per_second: f64) -> Self {
        self.requests_per_second = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            1.0
        };
        self
    }

    pub const fn burst_capacity(mut self, burst_capacity: usize) -> Self {
        self.burst_capacity = if burst_capacity == 0 { 1 } else { burst_capacity };
        self
    }

    pub const fn adaptive_from_headers(mut self, adaptive_from_headers: bool) -> Self {
        self.adaptive_from_headers = adaptive_from_headers;
        self
    }

    pub const fn max_cooldown(mut self, max_cooldown: Duration) -> Self {
        self.max_cooldown = max_cooldown;
        self
    }

    pub const fn reset_interpretation(mut self, reset_interpretation: ResetInterpretation) -> Self {
        self.reset_interpretation = reset_interpretation;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Header names read for the `limit`, `remaining` and `reset` quota hints.
/// The first present name in each list wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitHeaders {
    limit: Vec<String>,
    remaining: Vec<String>,
    reset: Vec<String>,
}

impl RateLimitHeaders {
    pub fn new<I, S>(limit: I, remaining: I, reset: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lower = |names: I| -> Vec<String> {
            names
                .into_iter()
                .map(|name| name.into().to_ascii_lowercase())
                .collect()
        };
        Self {
            limit: lower(limit),
            remaining: lower(remaining),
            reset: lower(reset),
        }
    }
}

impl Default for RateLimitHeaders {
    fn default() -> Self {
        Self::new(
            ["x-ratelimit-limit", "ratelimit-limit", "x-rate-limit-limit"],
            [
                "x-ratelimit-remaining",
                "ratelimit-remaining",
                "x-rate-limit-remaining",
            ],
            ["x-ratelimit-reset", "ratelimit-reset", "x-rate-limit-reset"],
        )
    }
}

/// Quota hints reported by the server alongside a response.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RateLimitHints {
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub reset: Option<f64>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHints {
    pub fn from_headers(headers: &HeaderMap, names: &RateLimitHeaders, now: SystemTime) -> Self {
        let number = |candidates: &[String]| {
            candidates
                .iter()
                .find_map(|name| header_str(headers, name))
                .and_then(|raw| raw.parse::<f64>().ok())
                .filter(|value| value.is_finite())
        };
        Self {
            limit: number(&names.limit),
            remaining: number(&names.remaining),
            reset: number(&names.reset),
            retry_after: parse_retry_after(headers, now),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset.is_none()
            && self.retry_after.is_none()
    }
}

/// Point-in-time copy of limiter state.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimiterSnapshot {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_rate: f64,
    pub baseline_refill_rate: f64,
    pub cooldown_remaining: Option<Duration>,
}

#[derive(Debug)]
struct RateLimiterState {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    baseline_refill_rate: f64,
    last_refill_at: Instant,
    cooldown_until: Option<Instant>,
}

impl RateLimiterState {
    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        self.tokens = (self.tokens + elapsed_secs * self.refill_rate).clamp(0.0, self.capacity);
        if let Some(cooldown_until) = self.cooldown_until
            && now >= cooldown_until
        {
            self.cooldown_until = None;
        }
    }

    fn wait_duration(&self, now: Instant) -> Duration {
        if let Some(cooldown_until) = self.cooldown_until
            && now < cooldown_until
        {
            return cooldown_until.saturating_duration_since(now);
        }
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= f64::EPSILON {
            return Duration::from_secs(60);
        }
        let needed_tokens = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(needed_tokens / self.refill_rate)
    }

    fn extend_cooldown(&mut self, now: Instant, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let until = now + delay;
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }
}

/// Token bucket shared by every request issued through one client.
///
/// Refill is computed lazily from elapsed time whenever the bucket is
/// touched; there is no background timer.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        let capacity = policy.burst_capacity.max(1) as f64;
        Self {
            policy,
            state: Mutex::new(RateLimiterState {
                capacity,
                tokens: capacity,
                refill_rate: policy.requests_per_second,
                baseline_refill_rate: policy.requests_per_second,
                last_refill_at: Instant::now(),
                cooldown_until: None,
            }),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Takes a token if one is available right now, otherwise returns how
    /// long the caller should wait before asking again.
    pub(crate) fn acquire_delay(&self) -> Duration {
        let now = Instant::now();
        let mut state = lock_unpoisoned(&self.state);
        state.refill(now);
        let wait = state.wait_duration(now);
        if wait.is_zero() {
            state.tokens = (state.tokens - 1.0).max(0.0);
        }
        wait
    }

    /// Suspends until a cooldown has passed and a token is available, then
    /// consumes the token. Returns the time spent waiting.
    ///
    /// Dropping the future before it resolves never consumes a token.
    pub async fn wait_for_slot(&self) -> Duration {
        let started = Instant::now();
        loop {
            let wait = self.acquire_delay();
            if wait.is_zero() {
                return started.elapsed();
            }
            sleep(wait.min(self.policy.poll_interval)).await;
        }
    }

    pub fn can_proceed(&self) -> bool {
        let now = Instant::now();
        let mut state = lock_unpoisoned(&self.state);
        state.refill(now);
        state.wait_duration(now).is_zero()
    }

    pub fn update_from_response(&self, hints: &RateLimitHints) {
        self.update_from_response_at(hints, SystemTime::now());
    }

    pub(crate) fn update_from_response_at(&self, hints: &RateLimitHints, wall_clock: SystemTime) {
        let now = Instant::now();
        let mut state = lock_unpoisoned(&self.state);
        state.refill(now);

        if let Some(retry_after) = hints.retry_after
            && !retry_after.is_zero()
        {
            let delay = retry_after.min(self.policy.max_cooldown);
            debug!(delay_ms = delay.as_millis() as u64, "rate limiter cooldown from retry-after");
            state.extend_cooldown(now, delay);
        }

        if !self.policy.adaptive_from_headers {
            return;
        }

        if let (Some(remaining), Some(reset)) = (hints.remaining, hints.reset)
            && remaining <= 0.0
            && let Some(delay) = resolve_reset_delay(
                reset,
                epoch_seconds(wall_clock),
                self.policy.reset_interpretation,
                self.policy.max_cooldown,
            )
        {
            debug!(
                delay_ms = delay.as_millis() as u64,
                "rate limiter cooldown from exhausted quota"
            );
            state.extend_cooldown(now, delay);
        }

        if let (Some(remaining), Some(limit)) = (hints.remaining, hints.limit)
            && limit > 0.0
        {
            let fraction = (remaining / limit).max(0.0);
            let factor = if fraction <= 0.10 {
                0.5
            } else if fraction <= 0.25 {
                0.75
            } else if fraction <= 0.50 {
                0.9
            } else {
                1.0
            };
            state.refill_rate = state.baseline_refill_rate * factor;
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let now = Instant::now();
        let mut state = lock_unpoisoned(&self.state);
        state.refill(now);
        RateLimiterSnapshot {
            capacity: state.capacity,
            tokens: state.tokens,
            refill_rate: state.refill_rate,
            baseline_refill_rate: state.baseline_refill_rate,
            cooldown_remaining: state
                .cooldown_until
                .map(|until| until.saturating_duration_since(now))
                .filter(|remaining| !remaining.is_zero()),
        }
    }
}

/// Resolves a `reset` header value into a wait, or `None` when the value is
/// unusable or already in the past. The result never exceeds `cap`.
pub(crate) fn resolve_reset_delay(
    reset: f64,
    now_epoch_secs: f64,
    interpretation: ResetInterpretation,
    cap: Duration,
) -> Option<Duration> {
    if !reset.is_finite() || reset < 0.0 {
        return None;
    }
    let is_epoch = match interpretation {
        ResetInterpretation::Auto {
            epoch_threshold_secs,
        } => reset >= epoch_threshold_secs,
        ResetInterpretation::EpochSeconds => true,
        ResetInterpretation::RelativeSeconds => false,
    };
    let seconds = if is_epoch {
        reset - now_epoch_secs
    } else {
        reset
    };
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    let delay = Duration::try_from_secs_f64(seconds).unwrap_or(cap);
    Some(delay.min(cap))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use http::{HeaderMap, HeaderValue};

    use super::{
        DEFAULT_MAX_COOLDOWN, RateLimitHeaders, RateLimitHints, RateLimitPolicy, RateLimiter,
        ResetInterpretation, resolve_reset_delay,
    };
    use crate::util::epoch_seconds;

    const NOW: f64 = 1_700_000_000.0;

    #[test]
    fn limiter_respects_burst_and_refill() {
        let limiter = RateLimiter::new(
            RateLimitPolicy::standard()
                .requests_per_second(20.0)
                .burst_capacity(1),
        );

        assert_eq!(limiter.acquire_delay(), Duration::ZERO);
        let wait = limiter.acquire_delay();
        assert!(wait >= Duration::from_millis(45));
        assert!(!limiter.can_proceed());

        std::thread::sleep(wait);
        assert!(limiter.can_proceed());
        assert_eq!(limiter.acquire_delay(), Duration::ZERO);
    }

    #[test]
    fn tokens_stay_within_capacity_across_ticks() {
        let limiter = RateLimiter::new(
            RateLimitPolicy::standard()
                .requests_per_second(500.0)
                .burst_capacity(3),
        );
        for tick in 0..40 {
            if tick % 3 == 0 {
                std::thread::sleep(Duration::from_millis(2));
            }
            let _ = limiter.acquire_delay();
            let snapshot = limiter.snapshot();
            assert!(snapshot.tokens >= 0.0, "tokens went negative: {snapshot:?}");
            assert!(
                snapshot.tokens <= snapshot.capacity,
                "tokens exceeded capacity: {snapshot:?}"
            );
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(limiter.snapshot().tokens, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_delays_next_slot() {
        let limiter = RateLimiter::new(RateLimitPolicy::standard());
        limiter.update_from_response(&RateLimitHints {
            retry_after: Some(Duration::from_secs(3)),
            ..RateLimitHints::default()
        });

        let started = tokio::time::Instant::now();
        limiter.wait_for_slot().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_millis(3100));
    }

    #[test]
    fn epoch_and_relative_resets_resolve_differently() {
        let auto = ResetInterpretation::default();
        let epoch = resolve_reset_delay(NOW + 30.0, NOW, auto, DEFAULT_MAX_COOLDOWN)
            .expect("future epoch reset should resolve");
        let relative = resolve_reset_delay(30.0, NOW, auto, DEFAULT_MAX_COOLDOWN)
            .expect("relative reset should resolve");
        assert_eq!(epoch, Duration::from_secs(30));
        assert_eq!(relative, Duration::from_secs(30));

        let epoch_far = resolve_reset_delay(NOW + 600.0, NOW, auto, DEFAULT_MAX_COOLDOWN)
            .expect("epoch reset should resolve");
        let relative_small = resolve_reset_delay(2.0, NOW, auto, DEFAULT_MAX_COOLDOWN)
            .expect("relative reset should resolve");
        assert!(epoch_far > relative_small * 100);
    }

    #[test]
    fn past_invalid_and_absurd_resets_are_bounded() {
        let auto = ResetInterpretation::default();
        assert_eq!(
            resolve_reset_delay(NOW - 3600.0, NOW, auto, DEFAULT_MAX_COOLDOWN),
            None
        );
        assert_eq!(resolve_reset_delay(-5.0, NOW, auto, DEFAULT_MAX_COOLDOWN), None);
        assert_eq!(
            resolve_reset_delay(f64::NAN, NOW, auto, DEFAULT_MAX_COOLDOWN),
            None
        );
        assert_eq!(
            resolve_reset_delay(f64::INFINITY, NOW, auto, DEFAULT_MAX_COOLDOWN),
            None
        );
        assert_eq!(
            resolve_reset_delay(NOW * 50.0, NOW, auto, DEFAULT_MAX_COOLDOWN),
            Some(DEFAULT_MAX_COOLDOWN)
        );
        assert_eq!(
            resolve_reset_delay(
                900_000_000.0,
                NOW,
                ResetInterpretation::RelativeSeconds,
                DEFAULT_MAX_COOLDOWN
            ),
            Some(DEFAULT_MAX_COOLDOWN)
        );
    }

    #[test]
    fn exhausted_quota_sets_cooldown() {
        let limiter = RateLimiter::new(RateLimitPolicy::standard());
        let wall_clock = SystemTime::now();
        limiter.update_from_response_at(
            &RateLimitHints {
                limit: Some(100.0),
                remaining: Some(0.0),
                reset: Some(epoch_seconds(wall_clock) + 5.0),
                retry_after: None,
            },
            wall_clock,
        );
        let cooldown = limiter
            .snapshot()
            .cooldown_remaining
            .expect("cooldown should be active");
        assert!(cooldown > Duration::from_secs(4));
        assert!(cooldown <= Duration::from_secs(5));
        assert!(!limiter.can_proceed());
    }

    #[test]
    fn refill_rate_steps_down_with_remaining_quota() {
        let limiter = RateLimiter::new(RateLimitPolicy::standard().requests_per_second(100.0));
        let rate_after = |remaining: f64| {
            limiter.update_from_response(&RateLimitHints {
                limit: Some(100.0),
                remaining: Some(remaining),
                ..RateLimitHints::default()
            });
            limiter.snapshot().refill_rate
        };

        assert_eq!(rate_after(5.0), 50.0);
        assert_eq!(rate_after(20.0), 75.0);
        assert_eq!(rate_after(40.0), 90.0);
        assert_eq!(rate_after(80.0), 100.0);
    }

    #[test]
    fn non_adaptive_policy_ignores_quota_headers() {
        let limiter = RateLimiter::new(
            RateLimitPolicy::standard()
                .requests_per_second(100.0)
                .adaptive_from_headers(false),
        );
        limiter.update_from_response(&RateLimitHints {
            limit: Some(100.0),
            remaining: Some(0.0),
            reset: Some(30.0),
            retry_after: None,
        });
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.refill_rate, 100.0);
        assert_eq!(snapshot.cooldown_remaining, None);
    }

    #[test]
    fn hints_are_read_case_insensitively_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Limit", HeaderValue::from_static("100"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("7"));
        headers.insert("RateLimit-Reset", HeaderValue::from_static("12"));
        headers.insert("Retry-After", HeaderValue::from_static("2"));

        let hints =
            RateLimitHints::from_headers(&headers, &RateLimitHeaders::default(), SystemTime::now());
        assert_eq!(hints.limit, Some(100.0));
        assert_eq!(hints.remaining, Some(7.0));
        assert_eq!(hints.reset, Some(12.0));
        assert_eq!(hints.retry_after, Some(Duration::from_secs(2)));
    }
}
