#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use connector_core::{
    Client, ClientBuilder, RetryPolicy, Transport, TransportError, TransportErrorKind,
    TransportFuture, TransportResponse,
};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Request, StatusCode};
use serde_json::Value;

pub const BASE_URL: &str = "https://api.example.com";

pub enum Step {
    Respond(TransportResponse),
    Fail(TransportErrorKind),
    Delayed(Duration, TransportResponse),
    Hang,
}

#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
}

impl CapturedRequest {
    pub fn query_value(&self, name: &str) -> Option<String> {
        let url = url::Url::parse(&self.uri).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

/// In-memory transport that replays a fixed script and records every call.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    captured: Mutex<Vec<CapturedRequest>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            captured: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().expect("lock captured requests").clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.captured
            .lock()
            .expect("lock captured requests")
            .push(CapturedRequest {
                method: request.method().to_string(),
                uri: request.uri().to_string(),
                headers: request.headers().clone(),
            });
        let next = self.script.lock().expect("lock script").pop_front();
        Box::pin(async move {
            match next {
                Some(Step::Respond(response)) => Ok(response),
                Some(Step::Fail(kind)) => Err(TransportError::new(kind, "scripted failure")),
                Some(Step::Delayed(delay, response)) => {
                    tokio::time::sleep(delay).await;
                    Ok(response)
                }
                Some(Step::Hang) => std::future::pending().await,
                None => Err(TransportError::new(
                    TransportErrorKind::Other,
                    "script exhausted",
                )),
            }
        })
    }
}

pub fn status(code: u16) -> Step {
    respond(code, Vec::new(), Bytes::new())
}

pub fn delayed_status(code: u16, delay: Duration) -> Step {
    match status(code) {
        Step::Respond(response) => Step::Delayed(delay, response),
        other => other,
    }
}

pub fn status_with_headers(code: u16, headers: Vec<(&'static str, &'static str)>) -> Step {
    respond(code, headers, Bytes::new())
}

pub fn json_response(code: u16, body: Value) -> Step {
    respond(
        code,
        vec![("content-type", "application/json")],
        Bytes::from(body.to_string()),
    )
}

pub fn respond(code: u16, headers: Vec<(&'static str, &'static str)>, body: Bytes) -> Step {
    let mut header_map = HeaderMap::new();
    for (name, value) in headers {
        header_map.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    if !header_map.contains_key(CONTENT_TYPE) && !body.is_empty() {
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    }
    Step::Respond(TransportResponse {
        status: StatusCode::from_u16(code).expect("valid status code"),
        headers: header_map,
        body,
    })
}

/// Fast, deterministic retry policy for tests.
pub fn quick_retry(max_attempts: usize) -> RetryPolicy {
    RetryPolicy::standard()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(10))
        .jitter(false)
}

pub fn builder(transport: &Arc<ScriptedTransport>) -> ClientBuilder {
    let transport: Arc<dyn Transport> = transport.clone();
    Client::builder(BASE_URL)
        .transport(transport)
        .retry_policy(quick_retry(3))
}

pub fn client(transport: &Arc<ScriptedTransport>) -> Client {
    builder(transport).try_build().expect("client should build")
}
