use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::error::TransportErrorKind;
use crate::util::classify_transport_error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
#[error("{kind} transport failure: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> BoxError {
        self.source
    }
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// Outbound HTTP seam. The executor applies timeouts and cancellation around
/// each call; implementations only perform one round trip.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_>;
}

type HyperClient = LegacyClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Default transport: a pooled hyper client speaking HTTP/1.1 and HTTP/2
/// over rustls with the webpki root store.
#[derive(Clone, Debug)]
pub struct HyperTransport {
    client: HyperClient,
    max_response_body_bytes: usize,
}

impl HyperTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_options(
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_POOL_IDLE_TIMEOUT,
            DEFAULT_MAX_RESPONSE_BODY_BYTES,
        )
    }

    pub fn with_options(
        connect_timeout: Duration,
        pool_idle_timeout: Duration,
        max_response_body_bytes: usize,
    ) -> Result<Self, TransportError> {
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        connector.set_connect_timeout(Some(connect_timeout));
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| TransportError::new(TransportErrorKind::Tls, source))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = LegacyClient::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .build(https);
        Ok(Self {
            client,
            max_response_body_bytes: max_response_body_bytes.max(1),
        })
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        Box::pin(async move {
            let response = self
                .client
                .request(request.map(Full::new))
                .await
                .map_err(|source| TransportError::new(classify_transport_error(&source), source))?;
            let (parts, body) = response.into_parts();
            let body = read_all_body_limited(body, self.max_response_body_bytes).await?;
            Ok(TransportResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        })
    }
}

async fn read_all_body_limited(
    mut body: Incoming,
    max_bytes: usize,
) -> Result<Bytes, TransportError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|source| TransportError::new(TransportErrorKind::Read, source))?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(TransportError::new(
                    TransportErrorKind::Other,
                    format!("response body exceeded {max_bytes} bytes"),
                ));
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
