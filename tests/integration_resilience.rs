mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use connector_core::prelude::{
    CircuitBreakerPolicy, CircuitState, Error, ErrorKind, Hook, HookError, HookRegistration,
    RequestPatch, RequestSpec, RetryPolicy,
};
use connector_core::{HookPhase, RateLimitPolicy, TransportErrorKind};
use http::HeaderValue;
use futures_util::future::join_all;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use support::{
    ScriptedTransport, Step, builder, client, delayed_status, json_response, status,
    status_with_headers,
};

#[tokio::test]
async fn aborting_hook_never_reaches_transport() {
    let transport = ScriptedTransport::new(vec![status(200)]);
    let client = builder(&transport)
        .hook(Hook::before_request(|context| {
            context.abort("tenant suspended");
            Ok(())
        }))
        .try_build()
        .expect("client should build");

    let error = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect_err("aborted request should fail");

    assert_eq!(transport.calls(), 0);
    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert!(!error.is_retryable());
    match error {
        Error::Aborted { reason, .. } => assert_eq!(reason, "tenant suspended"),
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(client.metrics_snapshot().hook_aborts, 1);
}

#[tokio::test(start_paused = true)]
async fn retries_server_error_then_succeeds() {
    let transport = ScriptedTransport::new(vec![status(503), json_response(200, json!({ "id": 7 }))]);
    let client = client(&transport);

    let response = client
        .get("/contacts/7")
        .send()
        .await
        .expect("second attempt should succeed");

    assert_eq!(transport.calls(), 2);
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.meta().retry_count, 1);
    assert_eq!(response.decoded(), Some(&json!({ "id": 7 })));

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.retries, 1);
    assert_eq!(metrics.attempts, 2);
    assert_eq!(metrics.requests_succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_sets_the_delay() {
    let transport = ScriptedTransport::new(vec![
        status_with_headers(429, vec![("retry-after", "3")]),
        status(200),
    ]);
    let client = client(&transport);

    let started = Instant::now();
    client
        .send(RequestSpec::get("/deals"))
        .await
        .expect("retry should succeed");

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_stops_before_sleeping() {
    let transport = ScriptedTransport::new(vec![
        status_with_headers(503, vec![("retry-after", "30")]),
        status(200),
    ]);
    let retried = Arc::new(Mutex::new(0_usize));
    let seen = Arc::clone(&retried);
    let client = builder(&transport)
        .retry_policy(support::quick_retry(3).retry_budget(Duration::from_secs(5)))
        .hook(Hook::on_retry(move |_context| {
            *seen.lock().expect("retry counter") += 1;
            Ok(())
        }))
        .try_build()
        .expect("client should build");

    let started = Instant::now();
    let error = client
        .send(RequestSpec::get("/deals"))
        .await
        .expect_err("budget should be exhausted");

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(transport.calls(), 1);
    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert!(matches!(error, Error::RetryBudgetExceeded { attempts: 1, .. }));
    assert_eq!(*retried.lock().expect("retry counter"), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_surface_the_last_failure() {
    let transport = ScriptedTransport::new(vec![
        Step::Fail(TransportErrorKind::Connect),
        Step::Fail(TransportErrorKind::Connect),
        status(502),
    ]);
    let client = client(&transport);

    let error = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect_err("all attempts fail");

    assert_eq!(transport.calls(), 3);
    assert_eq!(error.kind(), ErrorKind::ServerError);
    assert_eq!(error.status(), Some(502));
    assert_eq!(error.attempts(), Some(3));
}

#[tokio::test]
async fn client_errors_are_terminal() {
    let transport = ScriptedTransport::new(vec![
        status_with_headers(401, vec![("x-request-id", "req-123")]),
        status(200),
    ]);
    let client = client(&transport);

    let error = client
        .send(RequestSpec::get("/me"))
        .await
        .expect_err("401 is terminal");

    assert_eq!(transport.calls(), 1);
    assert_eq!(error.kind(), ErrorKind::AuthFailed);
    assert_eq!(error.request_id(), Some("req-123"));
    assert!(!error.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn transport_timeout_is_retried_then_reported() {
    let transport = ScriptedTransport::new(vec![Step::Hang, Step::Hang]);
    let client = builder(&transport)
        .retry_policy(support::quick_retry(2))
        .request_timeout(Duration::from_millis(200))
        .try_build()
        .expect("client should build");

    let error = client
        .send(RequestSpec::get("/slow"))
        .await
        .expect_err("both attempts time out");

    assert_eq!(transport.calls(), 2);
    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert!(matches!(error, Error::Timeout { timeout_ms: 200, .. }));
}

#[tokio::test(start_paused = true)]
async fn open_breaker_rejects_without_calling_transport() {
    let transport = ScriptedTransport::new(vec![status(500), status(500), status(200)]);
    let client = builder(&transport)
        .retry_policy(RetryPolicy::disabled())
        .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(2))
        .try_build()
        .expect("client should build");

    for _ in 0..2 {
        let error = client
            .send(RequestSpec::get("/contacts"))
            .await
            .expect_err("server error");
        assert_eq!(error.kind(), ErrorKind::ServerError);
    }
    let breaker = client.circuit_breaker().expect("breaker configured");
    assert_eq!(breaker.state(), CircuitState::Open);

    let error = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect_err("breaker should reject");
    assert_eq!(error.kind(), ErrorKind::CircuitOpen);
    assert!(!error.is_retryable());
    assert_eq!(transport.calls(), 2);
    assert_eq!(client.metrics_snapshot().circuit_rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn client_errors_do_not_trip_the_breaker() {
    let transport = ScriptedTransport::new(vec![status(404), status(404), status(404)]);
    let client = builder(&transport)
        .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(2))
        .try_build()
        .expect("client should build");

    for _ in 0..3 {
        let error = client
            .send(RequestSpec::get("/missing"))
            .await
            .expect_err("not found");
        assert_eq!(error.kind(), ErrorKind::InvalidRequest);
    }
    let breaker = client.circuit_breaker().expect("breaker configured");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn cancelled_token_short_circuits() {
    let transport = ScriptedTransport::new(vec![status(200)]);
    let client = client(&transport);
    let token = CancellationToken::new();
    token.cancel();

    let error = client
        .send_with_cancellation(RequestSpec::get("/contacts"), &token)
        .await
        .expect_err("cancelled");

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert!(matches!(error, Error::Cancelled { .. }));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_in_flight_attempt() {
    let transport = ScriptedTransport::new(vec![Step::Hang]);
    let client = client(&transport);
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let error = client
        .get("/contacts")
        .send_with_cancellation(&token)
        .await
        .expect_err("cancelled mid-flight");

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn hooks_run_by_priority_and_mutations_reach_transport() {
    let transport = ScriptedTransport::new(vec![status(200)]);
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&order);
    let second = Arc::clone(&order);
    let client = builder(&transport)
        .auth(|headers| {
            headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        })
        .hook(
            HookRegistration::new(Hook::before_request(move |context| {
                first.lock().expect("order lock").push("tenant");
                context.modify_request(RequestPatch::new().query("tenant", "acme"));
                Ok(())
            }))
            .priority(10),
        )
        .hook(
            HookRegistration::new(Hook::before_request(move |context| {
                second.lock().expect("order lock").push("auth-check");
                if context.request().headers().contains_key("authorization") {
                    Ok(())
                } else {
                    Err(HookError::new("missing credentials"))
                }
            }))
            .priority(-10),
        )
        .try_build()
        .expect("client should build");

    client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect("request should succeed");

    assert_eq!(*order.lock().expect("order lock"), vec!["auth-check", "tenant"]);
    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].query_value("tenant").as_deref(), Some("acme"));
    assert_eq!(
        requests[0].headers.get("authorization"),
        Some(&HeaderValue::from_static("Bearer secret"))
    );
}

#[tokio::test]
async fn advisory_hook_failure_does_not_fail_request() {
    let transport = ScriptedTransport::new(vec![status(200)]);
    let client = builder(&transport)
        .hook(
            HookRegistration::new(Hook::after_response(|_context| {
                Err(HookError::new("audit sink down"))
            }))
            .advisory(true)
            .name("audit"),
        )
        .try_build()
        .expect("client should build");

    let response = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect("advisory failure is ignored");
    assert_eq!(response.status(), http::StatusCode::OK);
}

#[tokio::test]
async fn validation_hook_failure_surfaces_as_validation_error() {
    let transport = ScriptedTransport::new(vec![status(200)]);
    let client = builder(&transport)
        .hook(Hook::before_request(|context| {
            if context.request().body_bytes().is_none() {
                return Err(HookError::validation("body is required"));
            }
            Ok(())
        }))
        .try_build()
        .expect("client should build");

    let error = client
        .send(RequestSpec::post("/contacts"))
        .await
        .expect_err("validation should fail");

    assert_eq!(transport.calls(), 0);
    assert_eq!(error.kind(), ErrorKind::ValidationError);
    assert!(matches!(
        error,
        Error::Hook {
            phase: HookPhase::BeforeRequest,
            ..
        }
    ));
}

#[tokio::test]
async fn after_response_hook_can_rewrite_the_envelope() {
    let transport = ScriptedTransport::new(vec![json_response(200, json!({ "data": { "id": 1 } }))]);
    let client = builder(&transport)
        .hook(Hook::after_response(|context| {
            let unwrapped = context
                .response()
                .decoded()
                .and_then(|body| body.get("data"))
                .cloned();
            if let Some(inner) = unwrapped {
                context.modify_response(connector_core::ResponsePatch::new().json(inner));
            }
            Ok(())
        }))
        .try_build()
        .expect("client should build");

    let response = client
        .send(RequestSpec::get("/contacts/1"))
        .await
        .expect("request should succeed");
    assert_eq!(response.decoded(), Some(&json!({ "id": 1 })));
}

#[tokio::test]
async fn error_hooks_observe_terminal_failures() {
    let transport = ScriptedTransport::new(vec![status(403)]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let client = builder(&transport)
        .hook(Hook::on_error(move |context| {
            recorder
                .lock()
                .expect("seen lock")
                .push((context.error().kind(), context.attempt()));
            Ok(())
        }))
        .try_build()
        .expect("client should build");

    let error = client
        .send(RequestSpec::get("/admin"))
        .await
        .expect_err("forbidden");
    assert_eq!(error.kind(), ErrorKind::AuthFailed);
    assert_eq!(
        *seen.lock().expect("seen lock"),
        vec![(ErrorKind::AuthFailed, 1)]
    );
}

#[tokio::test(start_paused = true)]
async fn limiter_cooldown_from_headers_delays_next_request() {
    let transport = ScriptedTransport::new(vec![
        status_with_headers(
            200,
            vec![("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "2")],
        ),
        status(200),
    ]);
    let client = builder(&transport)
        .rate_limit_policy(RateLimitPolicy::standard())
        .try_build()
        .expect("client should build");

    let first = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect("first request");
    let rate_limit = first.meta().rate_limit.as_ref().expect("rate limit snapshot");
    assert_eq!(rate_limit.hints.remaining, Some(0.0));

    let started = Instant::now();
    client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect("second request");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(client.metrics_snapshot().rate_limit_waits, 1);
}

#[tokio::test(start_paused = true)]
async fn throttled_probes_keep_the_breaker_open() {
    let transport = ScriptedTransport::new(vec![status(500), status(429), status(429)]);
    let client = builder(&transport)
        .retry_policy(RetryPolicy::disabled())
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(1)
                .success_threshold(2)
                .cool_down(Duration::from_secs(1)),
        )
        .try_build()
        .expect("client should build");
    let breaker = client.circuit_breaker().expect("breaker configured");

    let error = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect_err("server error");
    assert_eq!(error.kind(), ErrorKind::ServerError);
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let error = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect_err("throttled probe");
    assert_eq!(error.kind(), ErrorKind::RateLimit);
    assert_eq!(breaker.state(), CircuitState::Open);

    let error = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect_err("breaker reopened");
    assert_eq!(error.kind(), ErrorKind::CircuitOpen);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn retried_statuses_count_as_breaker_failures() {
    let transport = ScriptedTransport::new(vec![status(429), status(429)]);
    let client = builder(&transport)
        .retry_policy(support::quick_retry(2))
        .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(2))
        .try_build()
        .expect("client should build");

    let error = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect_err("throttled twice");
    assert_eq!(error.kind(), ErrorKind::RateLimit);
    assert!(error.is_retryable());
    let breaker = client.circuit_breaker().expect("breaker configured");
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.status().recent_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_sends_share_one_token_bucket() {
    let transport = ScriptedTransport::new((0..5).map(|_| status(200)).collect());
    let starts = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&starts);
    let client = builder(&transport)
        .rate_limit_policy(
            RateLimitPolicy::standard()
                .requests_per_second(1.0)
                .burst_capacity(2),
        )
        .hook(Hook::before_request(move |_context| {
            recorder.lock().expect("starts lock").push(Instant::now());
            Ok(())
        }))
        .try_build()
        .expect("client should build");

    let origin = Instant::now();
    let results = join_all((0..5).map(|_| client.send(RequestSpec::get("/contacts")))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(transport.calls(), 5);

    let mut offsets = starts
        .lock()
        .expect("starts lock")
        .iter()
        .map(|start| start.duration_since(origin))
        .collect::<Vec<_>>();
    offsets.sort();
    let before_refill = offsets
        .iter()
        .filter(|offset| **offset < Duration::from_millis(900))
        .count();
    assert_eq!(before_refill, 2);
    assert!(offsets[4] >= Duration::from_millis(2900));
    assert_eq!(client.metrics_snapshot().rate_limit_waits, 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_failures_are_all_counted_by_the_breaker() {
    let transport = ScriptedTransport::new(
        (0..6)
            .map(|_| delayed_status(500, Duration::from_millis(100)))
            .collect(),
    );
    let client = builder(&transport)
        .retry_policy(RetryPolicy::disabled())
        .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(3))
        .try_build()
        .expect("client should build");

    let results = join_all((0..6).map(|_| client.send(RequestSpec::get("/contacts")))).await;
    assert!(
        results
            .iter()
            .all(|result| matches!(result, Err(error) if error.kind() == ErrorKind::ServerError))
    );
    assert_eq!(transport.calls(), 6);

    let breaker = client.circuit_breaker().expect("breaker configured");
    let status = breaker.status();
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.recent_failures, 6);

    let error = client
        .send(RequestSpec::get("/contacts"))
        .await
        .expect_err("breaker should reject");
    assert_eq!(error.kind(), ErrorKind::CircuitOpen);
    assert_eq!(transport.calls(), 6);
    assert_eq!(client.metrics_snapshot().circuit_rejections, 1);
}
