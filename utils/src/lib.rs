pub mod backoff;
pub mod logger;
pub mod rate_limit;
