//! Classification of Application Auto Scaling errors

use thiserror::Error;

/// Broad class of a remote failure, used to pick a retry strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AwsErrorKind {
    /// Rate limited by the control plane
    Throttling,
    /// 5xx, timeouts, and connection failures
    Transient,
    /// Request rejected as malformed or inconsistent
    Validation,
    /// Addressed object does not exist
    ObjectNotFound,
    /// Another update to the same object is in progress
    ConcurrentUpdate,
    /// Account quota reached
    LimitExceeded,
    /// Missing permissions on the scaled resource or role
    AccessDenied,
    Other,
}

impl AwsErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AwsErrorKind::Throttling => "Throttling",
            AwsErrorKind::Transient => "Transient",
            AwsErrorKind::Validation => "Validation",
            AwsErrorKind::ObjectNotFound => "ObjectNotFound",
            AwsErrorKind::ConcurrentUpdate => "ConcurrentUpdate",
            AwsErrorKind::LimitExceeded => "LimitExceeded",
            AwsErrorKind::AccessDenied => "AccessDenied",
            AwsErrorKind::Other => "Other",
        }
    }
}

/// Error returned by an [`AutoscalingApi`](super::AutoscalingApi) call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed ({code}): {message}")]
pub struct AwsError {
    pub kind: AwsErrorKind,
    /// Remote operation name, e.g. "PutScalingPolicy"
    pub operation: &'static str,
    /// Service error code, e.g. "ValidationException"
    pub code: String,
    pub message: String,
}

impl AwsError {
    pub fn new(
        kind: AwsErrorKind,
        operation: &'static str,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build an error from a service error code, classifying it by code
    pub fn from_code(operation: &'static str, code: &str, message: impl Into<String>) -> Self {
        Self::new(classify_code(code), operation, code, message)
    }

    pub fn object_not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(
            AwsErrorKind::ObjectNotFound,
            operation,
            "ObjectNotFoundException",
            message,
        )
    }

    pub fn validation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(
            AwsErrorKind::Validation,
            operation,
            "ValidationException",
            message,
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == AwsErrorKind::ObjectNotFound
    }

    /// Throttling, transient, and concurrent-update failures are retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            AwsErrorKind::Throttling | AwsErrorKind::Transient | AwsErrorKind::ConcurrentUpdate
        )
    }
}

/// Map an Application Auto Scaling error code onto an [`AwsErrorKind`]
pub fn classify_code(code: &str) -> AwsErrorKind {
    match code {
        "ThrottlingException" | "Throttling" | "TooManyRequestsException"
        | "RequestLimitExceeded" => AwsErrorKind::Throttling,
        "InternalServiceException" | "InternalFailure" | "ServiceUnavailable"
        | "RequestTimeout" => AwsErrorKind::Transient,
        "ValidationException" | "InvalidParameterValue" | "MissingParameter" => {
            AwsErrorKind::Validation
        }
        "ObjectNotFoundException" => AwsErrorKind::ObjectNotFound,
        "ConcurrentUpdateException" => AwsErrorKind::ConcurrentUpdate,
        "LimitExceededException" => AwsErrorKind::LimitExceeded,
        "FailedResourceAccessException" | "AccessDeniedException" => AwsErrorKind::AccessDenied,
        _ => AwsErrorKind::Other,
    }
}
