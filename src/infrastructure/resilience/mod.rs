//! Resilience - 熔断与重试

mod circuit_breaker;

pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
