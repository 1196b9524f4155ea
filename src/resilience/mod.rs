mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerManager, CircuitBreakerState, CircuitState,
};
pub use retry::{with_retry, RetryPolicy, Retryable};
