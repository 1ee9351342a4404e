use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::response::ResponseEnvelope;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, PartialEq)]
pub struct ClientMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub rate_limit_waits: u64,
    pub rate_limit_wait_ms: u64,
    pub circuit_rejections: u64,
    pub hook_aborts: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    /// Failed requests keyed by error kind code, e.g. `SERVER_ERROR`.
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Arc<ClientMetricsInner>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    rate_limit_waits: AtomicU64,
    rate_limit_wait_ms: AtomicU64,
    circuit_rejections: AtomicU64,
    hook_aborts: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: ClientMetrics,
}

impl ClientMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limit_wait(&self, waited: Duration) {
        if waited.is_zero() {
            return;
        }
        self.inner.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
        self.inner
            .rate_limit_wait_ms
            .fetch_add(saturating_millis(waited), Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed(
        &self,
        result: &Result<ResponseEnvelope, Error>,
        latency: Duration,
    ) {
        self.record_latency(latency);
        match result {
            Ok(response) => {
                self.inner
                    .requests_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
            }
            Err(error) => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                match error {
                    Error::HttpStatus { status, .. } => self.add_status_count(*status),
                    Error::CircuitOpen { .. } => {
                        self.inner
                            .circuit_rejections
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Error::Aborted { .. } => {
                        self.inner.hook_aborts.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                self.add_error_count(error.kind());
            }
        }
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        ClientMetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            attempts: self.inner.attempts.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            rate_limit_waits: self.inner.rate_limit_waits.load(Ordering::Relaxed),
            rate_limit_wait_ms: self.inner.rate_limit_wait_ms.load(Ordering::Relaxed),
            circuit_rejections: self.inner.circuit_rejections.load(Ordering::Relaxed),
            hook_aborts: self.inner.hook_aborts.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner
            .latency_total_ms
            .fetch_add(saturating_millis(latency), Ordering::Relaxed);
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, kind: ErrorKind) {
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(kind.as_str().to_owned()).or_insert(0) += 1;
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Method;

    use super::ClientMetrics;
    use crate::error::Error;

    #[test]
    fn failures_are_counted_by_kind() {
        let metrics = ClientMetrics::default();
        metrics.record_request_started();
        let result = Err(Error::CircuitOpen {
            method: Method::GET,
            uri: "https://api.example.com/items".to_owned(),
            retry_after_ms: 100,
        });
        metrics.record_request_completed(&result, Duration::from_millis(3));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_started, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.circuit_rejections, 1);
        assert_eq!(snapshot.error_counts.get("CIRCUIT_OPEN"), Some(&1));
        assert_eq!(snapshot.latency_samples, 1);
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let metrics = ClientMetrics::default();
        let guard = metrics.enter_in_flight();
        assert_eq!(metrics.snapshot().in_flight, 1);
        drop(guard);
        assert_eq!(metrics.snapshot().in_flight, 0);
    }

    #[test]
    fn zero_waits_are_not_counted() {
        let metrics = ClientMetrics::default();
        metrics.record_rate_limit_wait(Duration::ZERO);
        metrics.record_rate_limit_wait(Duration::from_millis(40));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rate_limit_waits, 1);
        assert_eq!(snapshot.rate_limit_wait_ms, 40);
    }
}
