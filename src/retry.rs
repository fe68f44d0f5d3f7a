//! Retry: re-runs a fallible operation with a configurable delay between
//! attempts, stopping once it succeeds, exhausts its attempt budget, or
//! hits an error its predicate says not to retry.

use crate::delay::{DelayContext, DelayStrategy};
use crate::error::{InvalidArgument, RetryError};
use crate::event::{EventBus, SubscriptionId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Events published while an [`RetryExecutor`] runs.
#[derive(Debug, Clone, Copy)]
pub enum RetryEvent {
    /// About to sleep and retry as attempt `attempt`, after the previous
    /// attempt failed (or returned an unacceptable result).
    OnRetry { attempt: u32, delay: std::time::Duration },
    /// Attempt `attempt` failed with a retryable error.
    OnError { attempt: u32 },
    /// Attempt `attempt` failed with an error `retry_on_exception` rejected;
    /// surfaced immediately.
    OnIgnoredError { attempt: u32 },
    /// The operation returned an acceptable result on attempt `attempt`.
    OnSuccess { attempt: u32 },
}

type ResultPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type ExceptionPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Builds a [`RetryExecutor`].
pub struct RetryExecutorBuilder<T, E> {
    max_attempts: u32,
    delay_strategy: DelayStrategy,
    retry_on_result: Option<ResultPredicate<T>>,
    retry_on_exception: Option<ExceptionPredicate<E>>,
}

impl<T, E> RetryExecutorBuilder<T, E> {
    fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay_strategy: DelayStrategy::none(),
            retry_on_result: None,
            retry_on_exception: None,
        }
    }

    /// Delay applied between attempts. Defaults to [`DelayStrategy::none`].
    pub fn delay(mut self, strategy: DelayStrategy) -> Self {
        self.delay_strategy = strategy;
        self
    }

    /// Retries only while `predicate` returns `true` for the last result.
    /// Without this, a successful call is always accepted regardless of
    /// its value.
    pub fn retry_on_result(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on_result = Some(Arc::new(predicate));
        self
    }

    /// Retries only while `predicate` returns `true` for the last error.
    /// Without this, every error is considered retryable.
    pub fn retry_on_exception(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on_exception = Some(Arc::new(predicate));
        self
    }

    /// Fails if `max_attempts` is zero.
    pub fn build(self) -> Result<RetryExecutor<T, E>, InvalidArgument> {
        if self.max_attempts == 0 {
            return Err(InvalidArgument::new("max_attempts must be positive"));
        }
        Ok(RetryExecutor {
            max_attempts: self.max_attempts,
            delay_strategy: self.delay_strategy,
            retry_on_result: self.retry_on_result,
            retry_on_exception: self.retry_on_exception,
            events: EventBus::new(),
        })
    }
}

/// Retries a fallible async operation up to `max_attempts` times.
pub struct RetryExecutor<T, E> {
    max_attempts: u32,
    delay_strategy: DelayStrategy,
    retry_on_result: Option<ResultPredicate<T>>,
    retry_on_exception: Option<ExceptionPredicate<E>>,
    events: EventBus<RetryEvent>,
}

impl<T, E> fmt::Debug for RetryExecutor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_attempts", &self.max_attempts)
            .field("delay_strategy", &self.delay_strategy)
            .finish_non_exhaustive()
    }
}

impl<T, E> RetryExecutor<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Starts building an executor that retries up to `max_attempts` times
    /// (including the first attempt).
    pub fn builder(max_attempts: u32) -> RetryExecutorBuilder<T, E> {
        RetryExecutorBuilder::new(max_attempts)
    }

    /// Runs `operation`, retrying per this executor's configuration. Calls
    /// `on_before_attempt(attempt)` (1-based) immediately before each call.
    pub async fn execute_with_hook<F, Fut>(
        &self,
        operation: F,
        mut on_before_attempt: impl FnMut(u32),
    ) -> Result<T, RetryError<T, E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            on_before_attempt(attempt);
            match operation().await {
                Ok(value) => {
                    let must_retry = self
                        .retry_on_result
                        .as_ref()
                        .is_some_and(|predicate| predicate(&value));
                    if !must_retry {
                        if attempt > 1 {
                            tracing::info!(attempt, "operation recovered");
                        }
                        self.events.emit(RetryEvent::OnSuccess { attempt });
                        return Ok(value);
                    }
                    if attempt >= self.max_attempts {
                        tracing::warn!(attempts = attempt, "retry exhausted, last result rejected");
                        return Err(RetryError::MaxRetriesExceededWithResult {
                            attempts: attempt,
                            last_result: value,
                        });
                    }
                    let delay = self.delay_strategy.compute(
                        attempt,
                        &DelayContext::default(),
                    );
                    tracing::debug!(attempt, ?delay, "retrying after unacceptable result");
                    self.events.emit(RetryEvent::OnRetry { attempt: attempt + 1, delay });
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => {
                    let retryable = self
                        .retry_on_exception
                        .as_ref()
                        .map_or(true, |predicate| predicate(&error));
                    if !retryable {
                        tracing::debug!(attempt, "error is not retryable, surfacing immediately");
                        self.events.emit(RetryEvent::OnIgnoredError { attempt });
                        return Err(RetryError::NonRetryableError { attempt, error });
                    }
                    self.events.emit(RetryEvent::OnError { attempt });
                    if attempt >= self.max_attempts {
                        tracing::warn!(attempts = attempt, "retry exhausted, last error surfaced");
                        return Err(RetryError::MaxRetriesExceededWithError {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    let delay = self.delay_strategy.compute(
                        attempt,
                        &DelayContext::with_error(&DebugAsDisplay(&error)),
                    );
                    tracing::debug!(attempt, ?delay, "retrying after error");
                    self.events.emit(RetryEvent::OnRetry { attempt: attempt + 1, delay });
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Runs `operation`, retrying per this executor's configuration.
    pub async fn execute<F, Fut>(&self, operation: F) -> Result<T, RetryError<T, E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_hook(operation, |_| {}).await
    }

    /// Subscribes to this executor's events. See [`EventBus::subscribe`].
    pub fn on_event<Handler>(&self, handler: Handler) -> SubscriptionId
    where
        Handler: FnMut(RetryEvent) + Send + 'static,
    {
        self.events.subscribe(handler)
    }

    /// Cancels all current subscribers without affecting the executor
    /// itself.
    pub fn cancel_listeners(&self) {
        self.events.cancel_listeners();
    }
}

/// Wraps any `Debug` value so it can be formatted through `Display`, for
/// feeding an error that doesn't implement `Display` itself into
/// [`DelayContext::with_error`].
struct DebugAsDisplay<'a, T>(&'a T);

impl<T: fmt::Debug> fmt::Display for DebugAsDisplay<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.0, f)
    }
}
