//! AWS-related code shared by different modules.

use aws_config::{BehaviorVersion, Region};
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;

/// Load AWS configuration using standard conventions, pinned to the
/// configured region. SDK-internal retries are disabled; callers run their
/// own bounded retry loops so backoff schedules stay deterministic.
pub async fn load_aws_config(region: &str) -> aws_config::SdkConfig {
    aws_config::defaults(BehaviorVersion::v2025_01_17())
        .region(Region::new(region.to_owned()))
        .retry_config(aws_config::retry::RetryConfig::disabled())
        .load()
        .await
}

/// Is this SDK error worth retrying?
///
/// Dispatch, timeout and response-stream failures are assumed transient.
/// Service errors are transient only for known throttling/5xx codes.
pub fn is_transient_sdk_error<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_)
        | SdkError::DispatchFailure(_)
        | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(ctx) => matches!(
            ctx.err().code().unwrap_or(""),
            "Throttling"
                | "ThrottlingException"
                | "TooManyRequestsException"
                | "ProvisionedThroughputExceededException"
                | "RequestTimeout"
                | "SlowDown"
                | "InternalError"
                | "InternalServerError"
                | "ServiceUnavailable"
        ),
        _ => false,
    }
}
