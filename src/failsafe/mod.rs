//! Failsafe mechanisms for outbound calls: retry with backoff, local rate window

mod rate_window;
mod retry;

pub use rate_window::{RateWindow, RateWindowSnapshot};
pub use retry::{RetryPolicy, is_retryable_status};
