// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for nimbus-aws.

use aws_sdk_lambda::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Backend setup errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Required environment variable not set.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// Compute service error.
    #[error("Compute error: {0}")]
    Compute(#[from] nimbus_core::deployer::ComputeError),

    /// Queue error.
    #[error("Queue error: {0}")]
    Queue(#[from] nimbus_core::result_channel::QueueError),
}

/// Result type for backend setup.
pub type Result<T> = std::result::Result<T, Error>;

/// Service error codes worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "TooManyRequestsException",
    "ThrottlingException",
    "Throttling",
    "RequestThrottled",
    "ServiceException",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "EC2ThrottledException",
    "ResourceNotReadyException",
    "AWS.SimpleQueueService.RequestThrottled",
];

/// Whether an SDK error is a throttle, 5xx or connection failure.
pub(crate) fn is_transient<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => err.code().is_some_and(|code| TRANSIENT_CODES.contains(&code)),
        _ => false,
    }
}

/// Full error chain of an SDK error, suitable for logs.
pub(crate) fn describe<E, R>(err: &SdkError<E, R>) -> String
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug + 'static,
{
    DisplayErrorContext(err).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_lambda::error::ErrorMetadata;
    use aws_sdk_lambda::operation::get_function::GetFunctionError;

    type GetFunctionSdkError = SdkError<GetFunctionError, ()>;

    fn service_error(code: &str) -> GetFunctionSdkError {
        SdkError::service_error(
            GetFunctionError::generic(ErrorMetadata::builder().code(code).build()),
            (),
        )
    }

    #[test]
    fn test_connection_failures_are_transient() {
        assert!(is_transient(&GetFunctionSdkError::timeout_error("slow")));
        assert!(!is_transient(&GetFunctionSdkError::construction_failure(
            "bad input"
        )));
    }

    #[test]
    fn test_throttling_codes_are_transient() {
        assert!(is_transient(&service_error("TooManyRequestsException")));
        assert!(is_transient(&service_error("ServiceException")));
        assert!(!is_transient(&service_error("AccessDeniedException")));
        assert!(!is_transient(&service_error("ResourceNotFoundException")));
    }
}
