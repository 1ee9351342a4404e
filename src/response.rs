use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ConnectorResult;
use crate::error::Error;
use crate::rate_limit::{RateLimitHints, RateLimiterSnapshot};
use crate::util::{header_str, truncate_body};

/// Server quota hints seen on a response, alongside the client limiter state
/// right after the adaptive update.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitSnapshot {
    pub hints: RateLimitHints,
    pub limiter: Option<RateLimiterSnapshot>,
}

#[derive(Clone, Debug)]
pub struct ResponseMeta {
    pub timestamp: SystemTime,
    /// Time from the first attempt until the response was accepted.
    pub elapsed: Duration,
    /// Zero-based: `0` means the first attempt succeeded.
    pub retry_count: usize,
    pub request_id: Option<String>,
    pub rate_limit: Option<RateLimitSnapshot>,
}

#[derive(Clone, Debug)]
pub struct ResponseEnvelope {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    decoded: Option<Value>,
    meta: ResponseMeta,
}

impl ResponseEnvelope {
    /// Builds an envelope, decoding the body when the response declares a
    /// JSON content type.
    pub(crate) fn decode(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        meta: ResponseMeta,
    ) -> ConnectorResult<Self> {
        let decoded = if is_json_content(&headers) && !body.is_empty() {
            let value = serde_json::from_slice(&body).map_err(|source| Error::Deserialize {
                source,
                request_id: meta.request_id.clone(),
                body: truncate_body(&body),
            })?;
            Some(value)
        } else {
            None
        };
        Ok(Self {
            status,
            headers,
            body,
            decoded,
            meta,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Header names are lower-case; lookups are case-insensitive.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn decoded(&self) -> Option<&Value> {
        self.decoded.as_ref()
    }

    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub(crate) fn meta_mut(&mut self) -> &mut ResponseMeta {
        &mut self.meta
    }

    /// The decoded body, or a fresh parse of the raw body when the response
    /// did not declare JSON.
    pub fn json_value(&self) -> ConnectorResult<Value> {
        match &self.decoded {
            Some(value) => Ok(value.clone()),
            None => self.parse_body(),
        }
    }

    pub fn json<T>(&self) -> ConnectorResult<T>
    where
        T: DeserializeOwned,
    {
        match &self.decoded {
            Some(value) => T::deserialize(value).map_err(|source| Error::Deserialize {
                source,
                request_id: self.meta.request_id.clone(),
                body: truncate_body(&self.body),
            }),
            None => self.parse_body(),
        }
    }

    pub fn apply_patch(&mut self, patch: ResponsePatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        for (name, value) in &patch.headers {
            self.headers.insert(name.clone(), value.clone());
        }
        match patch.body {
            Some(PatchBody::Raw(body)) => {
                self.decoded = if is_json_content(&self.headers) {
                    serde_json::from_slice(&body).ok()
                } else {
                    None
                };
                self.body = body;
            }
            Some(PatchBody::Json { value, encoded }) => {
                self.body = encoded;
                self.decoded = Some(value);
            }
            None => {}
        }
    }

    fn parse_body<T>(&self) -> ConnectorResult<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            request_id: self.meta.request_id.clone(),
            body: truncate_body(&self.body),
        })
    }
}

#[derive(Clone, Debug)]
enum PatchBody {
    Raw(Bytes),
    Json { value: Value, encoded: Bytes },
}

/// Partial rewrite applied to a response by `after_response` hooks.
#[derive(Clone, Debug, Default)]
pub struct ResponsePatch {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<PatchBody>,
}

impl ResponsePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(PatchBody::Raw(body.into()));
        self
    }

    /// Replaces the body with `value`. The wire bytes are encoded here so the
    /// raw and decoded views never disagree.
    pub fn json(mut self, value: Value) -> Self {
        let encoded = Bytes::from(value.to_string());
        self.body = Some(PatchBody::Json { value, encoded });
        self
    }
}

fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let essence = value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            essence == "application/json" || essence.ends_with("+json")
        })
        .unwrap_or(false)
}
