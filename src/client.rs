use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::ConnectorResult;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerPolicy, CircuitState};
use crate::config::ClientConfig;
use crate::error::{Error, ErrorKind};
use crate::hooks::{BeforeRequestOutcome, HookPhase, HookPipeline, HookRegistration};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::pagination::{PaginationStrategy, Paginator};
use crate::rate_limit::{RateLimitHeaders, RateLimitHints, RateLimitPolicy, RateLimiter};
use crate::request::{RequestBuilder, RequestSpec};
use crate::response::{RateLimitSnapshot, ResponseEnvelope, ResponseMeta};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::{HyperTransport, Transport, TransportResponse};
use crate::util::{
    append_query_pairs, join_base_path, merge_headers, parse_header_name, parse_header_value,
    redact_uri_for_logs, request_id_from_headers, resolve_uri, truncate_body, validate_base_url,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CLIENT_NAME: &str = "connector-core";

/// Applies credentials to the outgoing headers before `before_request` hooks
/// run. Called once per attempt.
pub type AuthCallback = Arc<dyn Fn(&mut HeaderMap) + Send + Sync>;

pub struct ClientBuilder {
    base_url: String,
    client_name: String,
    request_timeout: Duration,
    default_headers: HeaderMap,
    default_query: Vec<(String, String)>,
    retry_policy: RetryPolicy,
    rate_limit_policy: Option<RateLimitPolicy>,
    rate_limit_headers: RateLimitHeaders,
    circuit_breaker_policy: Option<CircuitBreakerPolicy>,
    auth: Option<AuthCallback>,
    hooks: HookPipeline,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_headers: HeaderMap::new(),
            default_query: Vec::new(),
            retry_policy: RetryPolicy::standard(),
            rate_limit_policy: None,
            rate_limit_headers: RateLimitHeaders::default(),
            circuit_breaker_policy: None,
            auth: None,
            hooks: HookPipeline::new(),
            transport: None,
        }
    }

    /// Seeds a builder from host-loaded configuration. Auth, hooks and a
    /// custom transport are still registered on the returned builder.
    pub fn from_config(config: &ClientConfig) -> ConnectorResult<Self> {
        let mut builder = Self::new(config.base_url.clone())
            .request_timeout(config.request_timeout())
            .retry_policy(RetryPolicy::from(&config.retry));
        for (name, value) in &config.default_headers {
            builder = builder.try_default_header(name, value)?;
        }
        for (name, value) in &config.default_query {
            builder = builder.default_query(name.clone(), value.clone());
        }
        if let Some(rate_limit) = &config.rate_limit {
            builder = builder.rate_limit_policy(RateLimitPolicy::from(rate_limit));
        }
        if let Some(circuit_breaker) = &config.circuit_breaker {
            builder = builder.circuit_breaker_policy(CircuitBreakerPolicy::from(circuit_breaker));
        }
        Ok(builder)
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> ConnectorResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn default_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_query.push((name.into(), value.into()));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn rate_limit_policy(mut self, rate_limit_policy: RateLimitPolicy) -> Self {
        self.rate_limit_policy = Some(rate_limit_policy);
        self
    }

    pub fn rate_limit_headers(mut self, rate_limit_headers: RateLimitHeaders) -> Self {
        self.rate_limit_headers = rate_limit_headers;
        self
    }

    pub fn circuit_breaker_policy(mut self, circuit_breaker_policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker_policy = Some(circuit_breaker_policy);
        self
    }

    pub fn auth<F>(mut self, auth: F) -> Self
    where
        F: Fn(&mut HeaderMap) + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn hook(mut self, registration: impl Into<HookRegistration>) -> Self {
        self.hooks.register(registration);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn try_build(self) -> ConnectorResult<Client> {
        validate_base_url(&self.base_url)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HyperTransport::new().map_err(|source| Error::TransportInit { source })?,
            ),
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url: self.base_url,
                client_name: self.client_name,
                request_timeout: self.request_timeout,
                default_headers: self.default_headers,
                default_query: self.default_query,
                retry_policy: self.retry_policy,
                rate_limiter: self.rate_limit_policy.map(RateLimiter::new),
                rate_limit_headers: self.rate_limit_headers,
                circuit_breaker: self.circuit_breaker_policy.map(CircuitBreaker::new),
                auth: self.auth,
                hooks: self.hooks,
                transport,
                metrics: ClientMetrics::default(),
            }),
        })
    }
}

struct ClientInner {
    base_url: String,
    client_name: String,
    request_timeout: Duration,
    default_headers: HeaderMap,
    default_query: Vec<(String, String)>,
    retry_policy: RetryPolicy,
    rate_limiter: Option<RateLimiter>,
    rate_limit_headers: RateLimitHeaders,
    circuit_breaker: Option<CircuitBreaker>,
    auth: Option<AuthCallback>,
    hooks: HookPipeline,
    transport: Arc<dyn Transport>,
    metrics: ClientMetrics,
}

/// Connector client. Clones share one rate limiter, circuit breaker, hook
/// pipeline and metrics registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// A failed attempt, ready for the retry decision.
struct AttemptFailure {
    error: Error,
    decision: RetryDecision,
    retry_after: Option<Duration>,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.inner.rate_limiter.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.inner.circuit_breaker.as_ref()
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn send(&self, spec: RequestSpec) -> ConnectorResult<ResponseEnvelope> {
        self.execute(spec, None).await
    }

    /// Like [`Client::send`], but gives up with `CANCELLED` as soon as the
    /// token fires, whether the call is waiting for a limiter slot, on the
    /// wire, or sleeping between retries.
    pub async fn send_with_cancellation(
        &self,
        spec: RequestSpec,
        cancellation: &CancellationToken,
    ) -> ConnectorResult<ResponseEnvelope> {
        self.execute(spec, Some(cancellation)).await
    }

    pub fn paginate(&self, strategy: PaginationStrategy, spec: RequestSpec) -> Paginator {
        Paginator::new(self.clone(), strategy, spec)
    }

    async fn execute(
        &self,
        spec: RequestSpec,
        cancellation: Option<&CancellationToken>,
    ) -> ConnectorResult<ResponseEnvelope> {
        let metrics = &self.inner.metrics;
        metrics.record_request_started();
        let _in_flight = metrics.enter_in_flight();
        let started = Instant::now();
        let redacted_uri = redact_uri_for_logs(&join_base_path(&self.inner.base_url, spec.path()));
        let span = info_span!(
            "connector.request",
            client = %self.inner.client_name,
            operation = spec.operation_name().unwrap_or("-"),
            method = %spec.method(),
            uri = %redacted_uri,
        );

        let result = self
            .send_with_retry(spec, redacted_uri, started, cancellation)
            .instrument(span)
            .await;
        metrics.record_request_completed(&result, started.elapsed());
        result
    }

    async fn send_with_retry(
        &self,
        spec: RequestSpec,
        redacted_uri: String,
        started: Instant,
        cancellation: Option<&CancellationToken>,
    ) -> ConnectorResult<ResponseEnvelope> {
        let inner = &self.inner;
        let retry_policy = &inner.retry_policy;
        let max_attempts = retry_policy.configured_max_attempts();
        let method = spec.method().clone();
        let mut attempt = 1_usize;

        loop {
            if cancellation.is_some_and(CancellationToken::is_cancelled) {
                let error = cancelled_error(&method, &redacted_uri);
                return Err(self.fail(&spec, error, attempt, &redacted_uri).await);
            }

            if let Some(circuit_breaker) = &inner.circuit_breaker {
                let status = circuit_breaker.status();
                if status.state == CircuitState::Open {
                    let error = Error::CircuitOpen {
                        method: method.clone(),
                        uri: redacted_uri.clone(),
                        retry_after_ms: status.retry_after.unwrap_or_default().as_millis(),
                    };
                    warn!(attempt, "circuit breaker rejected request");
                    return Err(self.fail(&spec, error, attempt, &redacted_uri).await);
                }
            }

            if let Some(rate_limiter) = &inner.rate_limiter {
                let Some(waited) = cancellable(cancellation, rate_limiter.wait_for_slot()).await
                else {
                    let error = cancelled_error(&method, &redacted_uri);
                    return Err(self.fail(&spec, error, attempt, &redacted_uri).await);
                };
                if !waited.is_zero() {
                    debug!(waited_ms = waited.as_millis() as u64, "waited for rate limit slot");
                }
                inner.metrics.record_rate_limit_wait(waited);
            }

            let mut attempt_spec = spec.clone();
            if let Some(auth) = &inner.auth {
                auth(attempt_spec.headers_mut());
            }
            let attempt_spec = match inner.hooks.run_before_request(attempt_spec, attempt).await {
                Ok(BeforeRequestOutcome::Proceed(attempt_spec)) => attempt_spec,
                Ok(BeforeRequestOutcome::Aborted(reason)) => {
                    info!(attempt, reason = %reason, "request aborted by hook");
                    let error = Error::Aborted {
                        reason,
                        method: method.clone(),
                        uri: redacted_uri.clone(),
                    };
                    return Err(self.fail(&spec, error, attempt, &redacted_uri).await);
                }
                Err(source) => {
                    let error = Error::Hook {
                        phase: HookPhase::BeforeRequest,
                        method: method.clone(),
                        uri: redacted_uri.clone(),
                        source,
                    };
                    return Err(self.fail(&spec, error, attempt, &redacted_uri).await);
                }
            };

            let (request, attempt_uri) = match self.build_request(&attempt_spec) {
                Ok(built) => built,
                Err(error) => {
                    return Err(self.fail(&attempt_spec, error, attempt, &redacted_uri).await);
                }
            };
            let attempt_method = attempt_spec.method().clone();
            let timeout_value = attempt_spec
                .timeout_value()
                .unwrap_or(inner.request_timeout);

            inner.metrics.record_attempt();
            debug!(attempt, max_attempts, "sending request");
            let transport_result = cancellable(
                cancellation,
                timeout(timeout_value, inner.transport.send(request)),
            )
            .await;

            let mut failure = match transport_result {
                None => {
                    let error = cancelled_error(&attempt_method, &attempt_uri);
                    return Err(self.fail(&attempt_spec, error, attempt, &attempt_uri).await);
                }
                Some(Err(_elapsed)) => {
                    let mut decision = self.decision(attempt, &attempt_method, &attempt_uri);
                    decision.timed_out = true;
                    AttemptFailure {
                        error: Error::Timeout {
                            timeout_ms: timeout_value.as_millis(),
                            method: attempt_method.clone(),
                            uri: attempt_uri.clone(),
                            attempts: attempt,
                            retryable: false,
                        },
                        decision,
                        retry_after: None,
                    }
                }
                Some(Ok(Err(transport_error))) => {
                    let kind = transport_error.kind();
                    let mut decision = self.decision(attempt, &attempt_method, &attempt_uri);
                    decision.transport_error_kind = Some(kind);
                    AttemptFailure {
                        error: Error::Transport {
                            kind,
                            method: attempt_method.clone(),
                            uri: attempt_uri.clone(),
                            attempts: attempt,
                            retryable: false,
                            source: transport_error.into_source(),
                        },
                        decision,
                        retry_after: None,
                    }
                }
                Some(Ok(Ok(response))) => {
                    match self
                        .handle_response(&attempt_spec, response, attempt, started, &attempt_uri)
                        .await
                    {
                        Ok(envelope) => return Ok(envelope),
                        Err(ResponseOutcome::Terminal(error)) => {
                            return Err(self.fail(&attempt_spec, error, attempt, &attempt_uri).await);
                        }
                        Err(ResponseOutcome::Failed(failure)) => failure,
                    }
                }
            };

            let classified = retry_policy.should_retry_decision(&failure.decision);
            failure.error.set_retryable(classified);
            self.record_breaker_outcome(&failure.error);

            if attempt >= max_attempts || !classified {
                return Err(self
                    .fail(&attempt_spec, failure.error, attempt, &attempt_uri)
                    .await);
            }

            let retry_delay = retry_policy.retry_delay(attempt, failure.retry_after);
            if retry_policy.exceeds_budget(started.elapsed(), retry_delay) {
                let budget = retry_policy.configured_retry_budget().unwrap_or_default();
                warn!(
                    delay_ms = retry_delay.as_millis() as u64,
                    budget_ms = budget.as_millis() as u64,
                    error = %failure.error,
                    "retry budget exceeded"
                );
                let error = Error::RetryBudgetExceeded {
                    budget_ms: budget.as_millis(),
                    method: attempt_method,
                    uri: attempt_uri.clone(),
                    attempts: attempt,
                };
                return Err(self.fail(&attempt_spec, error, attempt, &attempt_uri).await);
            }

            if let Err(source) = inner
                .hooks
                .run_on_retry(&attempt_spec, &failure.error, attempt, retry_delay)
                .await
            {
                let error = Error::Hook {
                    phase: HookPhase::OnRetry,
                    method: attempt_method,
                    uri: attempt_uri.clone(),
                    source,
                };
                return Err(self.fail(&attempt_spec, error, attempt, &attempt_uri).await);
            }

            warn!(
                attempt,
                delay_ms = retry_delay.as_millis() as u64,
                error = %failure.error,
                "retrying request"
            );
            inner.metrics.record_retry();
            if !retry_delay.is_zero() && cancellable(cancellation, sleep(retry_delay)).await.is_none()
            {
                let error = cancelled_error(&attempt_method, &attempt_uri);
                return Err(self.fail(&attempt_spec, error, attempt, &attempt_uri).await);
            }
            attempt += 1;
        }
    }

    async fn handle_response(
        &self,
        request: &RequestSpec,
        response: TransportResponse,
        attempt: usize,
        started: Instant,
        uri: &str,
    ) -> Result<ResponseEnvelope, ResponseOutcome> {
        let inner = &self.inner;
        let TransportResponse {
            status,
            headers,
            body,
        } = response;
        let wall_clock = SystemTime::now();
        let hints = RateLimitHints::from_headers(&headers, &inner.rate_limit_headers, wall_clock);
        if let Some(rate_limiter) = &inner.rate_limiter
            && !hints.is_empty()
        {
            rate_limiter.update_from_response_at(&hints, wall_clock);
        }
        let request_id = request_id_from_headers(&headers);

        if !is_success(status) {
            debug!(status = status.as_u16(), "received error status");
            let mut decision = self.decision(attempt, request.method(), uri);
            decision.status = Some(status);
            return Err(ResponseOutcome::Failed(AttemptFailure {
                error: Error::HttpStatus {
                    status: status.as_u16(),
                    method: request.method().clone(),
                    uri: uri.to_owned(),
                    request_id,
                    attempts: attempt,
                    retryable: false,
                    body: truncate_body(&body),
                },
                decision,
                retry_after: hints.retry_after,
            }));
        }

        if let Some(circuit_breaker) = &inner.circuit_breaker {
            circuit_breaker.record_success();
        }

        let rate_limit = (!hints.is_empty() || inner.rate_limiter.is_some()).then(|| {
            RateLimitSnapshot {
                hints,
                limiter: inner.rate_limiter.as_ref().map(RateLimiter::snapshot),
            }
        });
        let meta = ResponseMeta {
            timestamp: wall_clock,
            elapsed: started.elapsed(),
            retry_count: attempt - 1,
            request_id,
            rate_limit,
        };
        let envelope = ResponseEnvelope::decode(status, headers, body, meta)
            .map_err(ResponseOutcome::Terminal)?;
        let mut envelope = inner
            .hooks
            .run_after_response(request, envelope, attempt)
            .await
            .map_err(|source| {
                ResponseOutcome::Terminal(Error::Hook {
                    phase: HookPhase::AfterResponse,
                    method: request.method().clone(),
                    uri: uri.to_owned(),
                    source,
                })
            })?;
        envelope.meta_mut().elapsed = started.elapsed();
        debug!(status = status.as_u16(), attempt, "request completed");
        Ok(envelope)
    }

    fn build_request(&self, spec: &RequestSpec) -> ConnectorResult<(Request<Bytes>, String)> {
        let inner = &self.inner;
        let mut query_pairs = inner
            .default_query
            .iter()
            .filter(|(name, _)| spec.query_pairs().iter().all(|(key, _)| key != name))
            .map(|(name, value)| (name.clone(), Some(value.clone())))
            .collect::<Vec<_>>();
        query_pairs.extend(spec.query_pairs().iter().cloned());
        let path = append_query_pairs(spec.path(), &query_pairs);
        let (uri_text, uri): (String, Uri) = resolve_uri(&inner.base_url, &path)?;
        let headers = merge_headers(&inner.default_headers, spec.headers());

        let mut builder = Request::builder().method(spec.method().clone()).uri(uri);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(spec.body_bytes().cloned().unwrap_or_default())
            .map_err(|source| Error::RequestBuild { source })?;
        Ok((request, redact_uri_for_logs(&uri_text)))
    }

    fn decision(&self, attempt: usize, method: &Method, uri: &str) -> RetryDecision {
        RetryDecision {
            attempt,
            max_attempts: self.inner.retry_policy.configured_max_attempts(),
            method: method.clone(),
            uri: uri.to_owned(),
            status: None,
            transport_error_kind: None,
            timed_out: false,
        }
    }

    /// Network, timeout, throttling and 5xx outcomes count against the
    /// breaker, as does anything the retry policy classified as transient.
    /// Remaining terminal statuses prove the upstream is reachable.
    fn record_breaker_outcome(&self, error: &Error) {
        let Some(circuit_breaker) = &self.inner.circuit_breaker else {
            return;
        };
        match error.kind() {
            ErrorKind::NetworkError
            | ErrorKind::Timeout
            | ErrorKind::ServerError
            | ErrorKind::RateLimit => circuit_breaker.record_failure(),
            _ if error.is_retryable() => circuit_breaker.record_failure(),
            _ if error.status().is_some() => circuit_breaker.record_success(),
            _ => {}
        }
    }

    /// Runs `on_error` hooks for a terminal failure. A failing hook replaces
    /// the error with a hook error of the `on_error` phase.
    async fn fail(&self, request: &RequestSpec, error: Error, attempt: usize, uri: &str) -> Error {
        match self.inner.hooks.run_on_error(request, &error, attempt).await {
            Ok(()) => error,
            Err(source) => {
                warn!(error = %error, hook_error = %source, "on_error hook failed");
                Error::Hook {
                    phase: HookPhase::OnError,
                    method: request.method().clone(),
                    uri: uri.to_owned(),
                    source,
                }
            }
        }
    }
}

enum ResponseOutcome {
    Failed(AttemptFailure),
    Terminal(Error),
}

fn is_success(status: StatusCode) -> bool {
    status.is_success() || status.is_informational() || status.is_redirection()
}

fn cancelled_error(method: &Method, uri: &str) -> Error {
    Error::Cancelled {
        method: method.clone(),
        uri: uri.to_owned(),
    }
}

/// Resolves to `None` if the token fires first. The token is polled first so
/// an already-cancelled call never starts the inner future.
async fn cancellable<F>(cancellation: Option<&CancellationToken>, future: F) -> Option<F::Output>
where
    F: Future,
{
    match cancellation {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = future => Some(output),
        },
        None => Some(future.await),
    }
}
