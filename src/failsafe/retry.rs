//! Retry policy with exponential backoff

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use reqwest::{Method, StatusCode, header::HeaderMap};

use crate::config::RetryConfig;

/// Retry policy for outbound API calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
    /// Randomize each delay
    pub jitter: bool,
    /// Retry POST without an idempotency header
    pub retry_post: bool,
    /// Header that marks a POST as safe to replay
    pub idempotency_header: String,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
            jitter: config.jitter,
            retry_post: config.retry_post,
            idempotency_header: config.idempotency_header.clone(),
        }
    }

    /// Maximum number of attempts, including the first
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delays to sleep between attempts, one per retry
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(self.max_retries as usize);
        if self.jitter {
            builder = builder.with_jitter();
        }
        builder.build()
    }

    /// Whether a failed call with this method and these headers may be replayed
    #[must_use]
    pub fn permits(&self, method: &Method, headers: &HeaderMap) -> bool {
        if *method == Method::POST || *method == Method::PATCH {
            self.retry_post || headers.contains_key(self.idempotency_header.as_str())
        } else {
            true
        }
    }
}

/// Transient upstream statuses
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}
