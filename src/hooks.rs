use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::error::Error;
use crate::request::{RequestPatch, RequestSpec};
use crate::response::{ResponseEnvelope, ResponsePatch};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HookError>> + Send + 'a>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookPhase {
    BeforeRequest,
    AfterResponse,
    OnError,
    OnRetry,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::BeforeRequest => "before_request",
            Self::AfterResponse => "after_response",
            Self::OnError => "on_error",
            Self::OnRetry => "on_retry",
        };
        formatter.write_str(text)
    }
}

/// Failure raised by a hook.
///
/// Errors built with [`HookError::validation`] surface as
/// `VALIDATION_ERROR`; everything else surfaces as `INVALID_REQUEST`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
    validation: bool,
    #[source]
    source: Option<BoxError>,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            validation: false,
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            validation: true,
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_validation(&self) -> bool {
        self.validation
    }
}

pub struct BeforeRequestContext {
    request: RequestSpec,
    attempt: usize,
    abort_reason: Option<String>,
}

impl BeforeRequestContext {
    pub fn request(&self) -> &RequestSpec {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut RequestSpec {
        &mut self.request
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn modify_request(&mut self, patch: RequestPatch) {
        self.request.apply_patch(patch);
    }

    /// Stops the request before it reaches the transport. Remaining
    /// `before_request` hooks are skipped.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.abort_reason = Some(reason.into());
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }
}

pub struct AfterResponseContext<'a> {
    request: &'a RequestSpec,
    response: ResponseEnvelope,
    attempt: usize,
}

impl AfterResponseContext<'_> {
    pub fn request(&self) -> &RequestSpec {
        self.request
    }

    pub fn response(&self) -> &ResponseEnvelope {
        &self.response
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn modify_response(&mut self, patch: ResponsePatch) {
        self.response.apply_patch(patch);
    }
}

pub struct ErrorContext<'a> {
    request: &'a RequestSpec,
    error: &'a Error,
    attempt: usize,
}

impl ErrorContext<'_> {
    pub fn request(&self) -> &RequestSpec {
        self.request
    }

    pub fn error(&self) -> &Error {
        self.error
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

pub struct RetryContext<'a> {
    request: &'a RequestSpec,
    error: &'a Error,
    attempt: usize,
    delay: Duration,
}

impl RetryContext<'_> {
    pub fn request(&self) -> &RequestSpec {
        self.request
    }

    /// The failure that triggered the retry.
    pub fn error(&self) -> &Error {
        self.error
    }

    /// The attempt that just failed; the retry will be `attempt + 1`.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Read-only view of one lifecycle event, handed to [`HookObserver`]s.
pub enum HookContext<'a> {
    BeforeRequest {
        request: &'a RequestSpec,
        attempt: usize,
    },
    AfterResponse {
        request: &'a RequestSpec,
        response: &'a ResponseEnvelope,
        attempt: usize,
    },
    OnError {
        request: &'a RequestSpec,
        error: &'a Error,
        attempt: usize,
    },
    OnRetry {
        request: &'a RequestSpec,
        error: &'a Error,
        attempt: usize,
        delay: Duration,
    },
}

impl HookContext<'_> {
    pub fn phase(&self) -> HookPhase {
        match self {
            Self::BeforeRequest { .. } => HookPhase::BeforeRequest,
            Self::AfterResponse { .. } => HookPhase::AfterResponse,
            Self::OnError { .. } => HookPhase::OnError,
            Self::OnRetry { .. } => HookPhase::OnRetry,
        }
    }

    pub fn request(&self) -> &RequestSpec {
        match self {
            Self::BeforeRequest { request, .. }
            | Self::AfterResponse { request, .. }
            | Self::OnError { request, .. }
            | Self::OnRetry { request, .. } => request,
        }
    }

    pub fn attempt(&self) -> usize {
        match self {
            Self::BeforeRequest { attempt, .. }
            | Self::AfterResponse { attempt, .. }
            | Self::OnError { attempt, .. }
            | Self::OnRetry { attempt, .. } => *attempt,
        }
    }
}

pub trait BeforeRequestHook: Send + Sync {
    fn before_request<'a>(&'a self, context: &'a mut BeforeRequestContext) -> HookFuture<'a>;
}

pub trait AfterResponseHook: Send + Sync {
    fn after_response<'a>(&'a self, context: &'a mut AfterResponseContext<'_>)
    -> HookFuture<'a>;
}

pub trait ErrorHook: Send + Sync {
    fn on_error<'a>(&'a self, context: &'a ErrorContext<'_>) -> HookFuture<'a>;
}

pub trait RetryHook: Send + Sync {
    fn on_retry<'a>(&'a self, context: &'a RetryContext<'_>) -> HookFuture<'a>;
}

/// Infallible observer called for every phase, typically logging or metrics.
pub trait HookObserver: Send + Sync {
    fn observe(&self, context: &HookContext<'_>);
}

/// Adapts a synchronous closure into a hook for one phase.
pub struct FnHook<F>(pub F);

impl<F> BeforeRequestHook for FnHook<F>
where
    F: Fn(&mut BeforeRequestContext) -> Result<(), HookError> + Send + Sync,
{
    fn before_request<'a>(&'a self, context: &'a mut BeforeRequestContext) -> HookFuture<'a> {
        let result = (self.0)(context);
        Box::pin(async move { result })
    }
}

impl<F> AfterResponseHook for FnHook<F>
where
    F: Fn(&mut AfterResponseContext<'_>) -> Result<(), HookError> + Send + Sync,
{
    fn after_response<'a>(
        &'a self,
        context: &'a mut AfterResponseContext<'_>,
    ) -> HookFuture<'a> {
        let result = (self.0)(context);
        Box::pin(async move { result })
    }
}

impl<F> ErrorHook for FnHook<F>
where
    F: Fn(&ErrorContext<'_>) -> Result<(), HookError> + Send + Sync,
{
    fn on_error<'a>(&'a self, context: &'a ErrorContext<'_>) -> HookFuture<'a> {
        let result = (self.0)(context);
        Box::pin(async move { result })
    }
}

impl<F> RetryHook for FnHook<F>
where
    F: Fn(&RetryContext<'_>) -> Result<(), HookError> + Send + Sync,
{
    fn on_retry<'a>(&'a self, context: &'a RetryContext<'_>) -> HookFuture<'a> {
        let result = (self.0)(context);
        Box::pin(async move { result })
    }
}

impl<F> HookObserver for FnHook<F>
where
    F: Fn(&HookContext<'_>) + Send + Sync,
{
    fn observe(&self, context: &HookContext<'_>) {
        (self.0)(context);
    }
}

#[derive(Clone)]
pub enum Hook {
    BeforeRequest(Arc<dyn BeforeRequestHook>),
    AfterResponse(Arc<dyn AfterResponseHook>),
    OnError(Arc<dyn ErrorHook>),
    OnRetry(Arc<dyn RetryHook>),
    Observer(Arc<dyn HookObserver>),
}

impl Hook {
    pub fn before_request<F>(hook: F) -> Self
    where
        F: Fn(&mut BeforeRequestContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Self::BeforeRequest(Arc::new(FnHook(hook)))
    }

    pub fn after_response<F>(hook: F) -> Self
    where
        F: Fn(&mut AfterResponseContext<'_>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Self::AfterResponse(Arc::new(FnHook(hook)))
    }

    pub fn on_error<F>(hook: F) -> Self
    where
        F: Fn(&ErrorContext<'_>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Self::OnError(Arc::new(FnHook(hook)))
    }

    pub fn on_retry<F>(hook: F) -> Self
    where
        F: Fn(&RetryContext<'_>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Self::OnRetry(Arc::new(FnHook(hook)))
    }

    pub fn observer<F>(observer: F) -> Self
    where
        F: Fn(&HookContext<'_>) + Send + Sync + 'static,
    {
        Self::Observer(Arc::new(FnHook(observer)))
    }

    /// The phase this hook runs in; observers run in every phase.
    pub fn phase(&self) -> Option<HookPhase> {
        match self {
            Self::BeforeRequest(_) => Some(HookPhase::BeforeRequest),
            Self::AfterResponse(_) => Some(HookPhase::AfterResponse),
            Self::OnError(_) => Some(HookPhase::OnError),
            Self::OnRetry(_) => Some(HookPhase::OnRetry),
            Self::Observer(_) => None,
        }
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase() {
            Some(phase) => phase.to_string(),
            None => "observer".to_owned(),
        };
        formatter.debug_tuple("Hook").field(&phase).finish()
    }
}

#[derive(Clone, Debug)]
pub struct HookRegistration {
    hook: Hook,
    priority: i32,
    advisory: bool,
    name: Option<String>,
}

impl HookRegistration {
    pub fn new(hook: Hook) -> Self {
        Self {
            hook,
            priority: 0,
            advisory: false,
            name: None,
        }
    }

    /// Lower priorities run first. Unset priority is `0`.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Failures of an advisory hook are logged and otherwise ignored.
    pub fn advisory(mut self, advisory: bool) -> Self {
        self.advisory = advisory;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

impl From<Hook> for HookRegistration {
    fn from(hook: Hook) -> Self {
        Self::new(hook)
    }
}

pub(crate) enum BeforeRequestOutcome {
    Proceed(RequestSpec),
    Aborted(String),
}

#[derive(Clone, Debug, Default)]
pub struct HookPipeline {
    registrations: Vec<HookRegistration>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook. Hooks with equal priority keep registration order.
    pub fn register(&mut self, registration: impl Into<HookRegistration>) {
        self.registrations.push(registration.into());
        self.registrations
            .sort_by_key(|registration| registration.priority);
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub(crate) async fn run_before_request(
        &self,
        request: RequestSpec,
        attempt: usize,
    ) -> Result<BeforeRequestOutcome, HookError> {
        let mut context = BeforeRequestContext {
            request,
            attempt,
            abort_reason: None,
        };
        for registration in &self.registrations {
            match &registration.hook {
                Hook::BeforeRequest(hook) => {
                    let result = hook.before_request(&mut context).await;
                    if let Some(reason) = context.abort_reason.take() {
                        return Ok(BeforeRequestOutcome::Aborted(reason));
                    }
                    handle_result(registration, HookPhase::BeforeRequest, result)?;
                }
                Hook::Observer(observer) => observer.observe(&HookContext::BeforeRequest {
                    request: &context.request,
                    attempt,
                }),
                _ => {}
            }
        }
        Ok(BeforeRequestOutcome::Proceed(context.request))
    }

    pub(crate) async fn run_after_response(
        &self,
        request: &RequestSpec,
        response: ResponseEnvelope,
        attempt: usize,
    ) -> Result<ResponseEnvelope, HookError> {
        let mut context = AfterResponseContext {
            request,
            response,
            attempt,
        };
        for registration in &self.registrations {
            match &registration.hook {
                Hook::AfterResponse(hook) => {
                    let result = hook.after_response(&mut context).await;
                    handle_result(registration, HookPhase::AfterResponse, result)?;
                }
                Hook::Observer(observer) => observer.observe(&HookContext::AfterResponse {
                    request,
                    response: &context.response,
                    attempt,
                }),
                _ => {}
            }
        }
        Ok(context.response)
    }

    pub(crate) async fn run_on_error(
        &self,
        request: &RequestSpec,
        error: &Error,
        attempt: usize,
    ) -> Result<(), HookError> {
        let context = ErrorContext {
            request,
            error,
            attempt,
        };
        for registration in &self.registrations {
            match &registration.hook {
                Hook::OnError(hook) => {
                    let result = hook.on_error(&context).await;
                    handle_result(registration, HookPhase::OnError, result)?;
                }
                Hook::Observer(observer) => observer.observe(&HookContext::OnError {
                    request,
                    error,
                    attempt,
                }),
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) async fn run_on_retry(
        &self,
        request: &RequestSpec,
        error: &Error,
        attempt: usize,
        delay: Duration,
    ) -> Result<(), HookError> {
        let context = RetryContext {
            request,
            error,
            attempt,
            delay,
        };
        for registration in &self.registrations {
            match &registration.hook {
                Hook::OnRetry(hook) => {
                    let result = hook.on_retry(&context).await;
                    handle_result(registration, HookPhase::OnRetry, result)?;
                }
                Hook::Observer(observer) => observer.observe(&HookContext::OnRetry {
                    request,
                    error,
                    attempt,
                    delay,
                }),
                _ => {}
            }
        }
        Ok(())
    }
}

fn handle_result(
    registration: &HookRegistration,
    phase: HookPhase,
    result: Result<(), HookError>,
) -> Result<(), HookError> {
    match result {
        Ok(()) => Ok(()),
        Err(error) if registration.advisory => {
            warn!(
                hook = registration.label(),
                phase = %phase,
                error = %error,
                "advisory hook failed"
            );
            Ok(())
        }
        Err(error) => Err(error),
    }
}
