//! Resilience primitives for calls to unreliable dependencies: a suspending
//! semaphore, three rate limiter algorithms (optionally keyed), a circuit
//! breaker, and a retry executor — each configurable, each observable
//! through its own event bus.

pub mod circuit_breaker;
pub mod clock;
pub mod delay;
pub mod error;
pub mod event;
pub mod rate_limiter;
pub mod retry;
mod ring_buffer;
mod semaphore;
mod sliding_window;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerState,
    CircuitBreakerStats,
};
pub use delay::{DelayContext, DelayStrategy};
pub use rate_limiter::{FixedWindowCounter, KeyedRateLimiter, RateLimiter, SlidingWindowCounter, TokenBucket};
pub use retry::{RetryEvent, RetryExecutor, RetryExecutorBuilder};
pub use semaphore::{InMemorySemaphoreState, SemaphorePermit, SemaphoreState, SuspendableSemaphore};

pub use error::{
    CircuitBreakerError, InvalidArgument, RateLimiterError, ResilienceError, RetryError,
    SemaphoreError,
};
