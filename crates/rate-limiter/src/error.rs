use thiserror::Error;

use crate::limiter::RateDecision;

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {} of {} requests used", .0.used, .0.limit)]
    Exceeded(RateDecision),

    #[error("Counter store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RateLimitError>;
