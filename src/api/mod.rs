//! Outbound marketplace API access

mod gateway;

pub use gateway::{
    ApiGateway, ApiRequest, DEFAULT_RETRY_AFTER_SECS, RateLimitStatus, UpstreamRateLimit,
};
