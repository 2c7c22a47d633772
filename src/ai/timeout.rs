//! Timeout Helpers
//!
//! Wraps provider calls in `tokio::time::timeout` and converts expiry into
//! a `Timeout` category `ProviderError`.
//!
//! ## Usage
//!
//! ```ignore
//! use crate::ai::timeout::with_call_timeout;
//!
//! let result = with_call_timeout(
//!     Duration::from_secs(30),
//!     adapter.generate(prompt, &params, timeout),
//!     "openai",
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::types::ProviderError;

/// Execute a provider call with a timeout.
///
/// The adapter's own error passes through unchanged; expiry becomes a
/// `Timeout` category error attributed to `provider`.
pub async fn with_call_timeout<T, F>(
    timeout: Duration,
    future: F,
    provider: &str,
) -> std::result::Result<T, ProviderError>
where
    F: Future<Output = std::result::Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::timeout(provider, timeout)),
    }
}
