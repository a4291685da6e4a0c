//! Support utilities for [`keen_retry`]'s retry API.

use core::fmt;

use keen_retry::RetryResult;
use reqwest::StatusCode;

use crate::prelude::*;

/// Convert a [`Result`] into a [`RetryResult`].
pub(crate) trait IntoRetryResult<T, E> {
    /// Convert a [`Result`] into an appropriate [`RetryResult`],
    /// depending on the return value of `is_transient`.
    fn into_retry_result<F>(self, is_transient: F) -> RetryResult<(), (), T, E>
    where
        F: FnOnce(&E) -> bool;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E>
where
    E: fmt::Debug,
{
    fn into_retry_result<F>(self, is_transient: F) -> RetryResult<(), (), T, E>
    where
        F: FnOnce(&E) -> bool,
    {
        match self {
            Ok(value) => RetryResult::Ok {
                reported_input: (),
                output: value,
            },
            Err(error) if is_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                RetryResult::Transient { input: (), error }
            }
            Err(error) => RetryResult::Fatal { input: (), error },
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they've been observed
/// in the wild, investigated and determined to be transient. This prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            let transient_failures = [
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ];
            transient_failures.contains(&status)
        } else if self.is_builder() || self.is_decode() {
            false
        } else {
            // Assume all other kinds of HTTP errors are transient. Unfortunately,
            // there are a lot of things that can go wrong, and `reqwest` doesn't
            // expose most of them in sufficient detail to be certain which are
            // transient.
            true
        }
    }
}

/// Is this HTTP status worth retrying at the response level?
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }
}
