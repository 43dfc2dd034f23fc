pub mod classify;
pub mod token_bucket;
pub mod types;


pub use classify::{classify, retry_delay};
pub use token_bucket::RateLimiter;
pub use types::{
    FailureClass, LimiterCounts, LimiterError, ProviderFailure, RateLimiterConfig,
};
