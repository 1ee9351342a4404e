//! `connector_core` is the transport and resilience layer shared by generated
//! HTTP API connectors.
//!
//! Every call goes through one executor that gates on a circuit breaker,
//! paces with an adaptive token bucket, runs lifecycle hooks, and retries
//! transient failures inside a wall-clock budget. Paginated endpoints are
//! exposed as lazy, cancellable page sequences.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use connector_core::prelude::{
//!     CircuitBreakerPolicy, Client, PaginationStrategy, RateLimitPolicy, RetryPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com")
//!         .request_timeout(Duration::from_secs(5))
//!         .retry_policy(RetryPolicy::standard().max_attempts(4))
//!         .rate_limit_policy(RateLimitPolicy::standard().requests_per_second(5.0))
//!         .circuit_breaker_policy(CircuitBreakerPolicy::standard())
//!         .auth(|headers| {
//!             headers.insert("authorization", "Bearer secret".parse().expect("header"));
//!         })
//!         .try_build()?;
//!
//!     let contacts = client
//!         .get("/crm/v3/objects/contacts")
//!         .operation("contacts.list")
//!         .paginate(PaginationStrategy::cursor(100))
//!         .max_items(250)
//!         .collect_all()
//!         .await?;
//!
//!     println!("fetched {} contacts", contacts.len());
//!     Ok(())
//! }
//! ```

mod circuit_breaker;
mod client;
mod config;
mod error;
mod hooks;
mod metrics;
pub mod pagination;
mod rate_limit;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerPolicy, CircuitState, CircuitStatus,
};
pub use crate::client::{AuthCallback, Client, ClientBuilder};
pub use crate::config::{
    CircuitBreakerConfig, ClientConfig, RateLimitConfig, ResetMode, RetryConfig,
};
pub use crate::error::{Error, ErrorKind, TransportErrorKind};
pub use crate::hooks::{
    AfterResponseContext, AfterResponseHook, BeforeRequestContext, BeforeRequestHook, ErrorContext,
    ErrorHook, FnHook, Hook, HookContext, HookError, HookFuture, HookObserver, HookPhase,
    HookPipeline, HookRegistration, RetryContext, RetryHook,
};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::pagination::{
    CursorPagination, OffsetPagination, PageNumberPagination, PaginationStrategy, Paginator,
};
pub use crate::rate_limit::{
    RateLimitHeaders, RateLimitHints, RateLimitPolicy, RateLimiter, RateLimiterSnapshot,
    ResetInterpretation,
};
pub use crate::request::{RequestBuilder, RequestPatch, RequestSpec};
pub use crate::response::{RateLimitSnapshot, ResponseEnvelope, ResponseMeta, ResponsePatch};
pub use crate::retry::{RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::transport::{
    HyperTransport, Transport, TransportError, TransportFuture, TransportResponse,
};

pub type ConnectorResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CircuitBreakerPolicy, CircuitState, Client, ClientConfig, ConnectorResult, Error,
        ErrorKind, Hook, HookError, HookRegistration, PaginationStrategy, RateLimitPolicy,
        RequestPatch, RequestSpec, ResponseEnvelope, ResponsePatch, RetryPolicy,
    };
}
