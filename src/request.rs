use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::ConnectorResult;
use crate::client::Client;
use crate::error::Error;
use crate::pagination::{PaginationStrategy, Paginator};
use crate::response::ResponseEnvelope;
use crate::util::{parse_header_name, parse_header_value};

/// One logical API operation, before the executor resolves it against the
/// client's base URL and defaults.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    method: Method,
    path: String,
    query_pairs: Vec<(String, Option<String>)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    operation: Option<String>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            operation: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), Some(value.into())));
        self
    }

    /// Adds a query pair whose value may be absent; absent values are dropped
    /// when the URI is built.
    pub fn query_opt(mut self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.query_pairs.push((name.into(), value.map(Into::into)));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ConnectorResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> ConnectorResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Logical operation name used to correlate logs and metrics.
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, Option<String>)] {
        &self.query_pairs
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query_pairs
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Replaces every pair named `name` with a single pair.
    pub fn set_query(&mut self, name: &str, value: Option<String>) {
        self.query_pairs.retain(|(key, _)| key != name);
        self.query_pairs.push((name.to_owned(), value));
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn apply_patch(&mut self, patch: RequestPatch) {
        for (name, value) in &patch.headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self.query_pairs.extend(patch.query_pairs);
        if let Some(path) = patch.path {
            self.path = path;
        }
        if let Some(body) = patch.body {
            self.body = Some(body);
        }
        if let Some(timeout) = patch.timeout {
            self.timeout = Some(timeout);
        }
    }
}

/// Partial update merged into an in-flight request by `before_request` hooks.
/// Headers overwrite by name, query pairs are appended.
#[derive(Clone, Debug, Default)]
pub struct RequestPatch {
    headers: HeaderMap,
    query_pairs: Vec<(String, Option<String>)>,
    path: Option<String>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
}

impl RequestPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ConnectorResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), Some(value.into())));
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }
}

#[must_use]
pub struct RequestBuilder<'a> {
    client: &'a Client,
    spec: RequestSpec,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, path: String) -> Self {
        Self {
            client,
            spec: RequestSpec::new(method, path),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.spec = self.spec.header(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> ConnectorResult<Self> {
        self.spec = self.spec.try_header(name, value)?;
        Ok(self)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec = self.spec.query(name, value);
        self
    }

    pub fn query_opt(mut self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.spec = self.spec.query_opt(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.spec = self.spec.body(body);
        self
    }

    pub fn json<T>(mut self, payload: &T) -> ConnectorResult<Self>
    where
        T: Serialize + ?Sized,
    {
        self.spec = self.spec.json(payload)?;
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec = self.spec.timeout(timeout);
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.spec = self.spec.operation(operation);
        self
    }

    pub fn into_spec(self) -> RequestSpec {
        self.spec
    }

    pub async fn send(self) -> ConnectorResult<ResponseEnvelope> {
        self.client.send(self.spec).await
    }

    pub async fn send_with_cancellation(
        self,
        cancellation: &CancellationToken,
    ) -> ConnectorResult<ResponseEnvelope> {
        self.client
            .send_with_cancellation(self.spec, cancellation)
            .await
    }

    pub async fn send_json<T>(self) -> ConnectorResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send().await?;
        response.json()
    }

    pub fn paginate(self, strategy: PaginationStrategy) -> Paginator {
        self.client.paginate(strategy, self.spec)
    }
}
