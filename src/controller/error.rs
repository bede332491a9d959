//! Error types for the autoscaling controllers

use std::time::Duration;

use kube::runtime::controller::Action;
use thiserror::Error;
use tracing::{error, warn};

use crate::aws::AwsError;

/// Error variants are named with the `Error` suffix where they wrap a failure class
/// (e.g., `KubeError`, `ValidationError`), matching how they read at call sites.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Application Auto Scaling error: {0}")]
    Aws(#[from] AwsError),

    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("Identity {identity} is already managed by {owner}")]
    IdentityConflict { identity: String, owner: String },

    #[error("Adoption is ambiguous: {0}")]
    AdoptionAmbiguous(String),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    #[error("Permanent error (will not retry): {0}")]
    PermanentError(String),
}

impl Error {
    /// Check if this error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::Aws(e) => e.is_retryable(),
            Error::TransientError(_) => true,
            Error::DependencyNotReady(_) => true,
            Error::NotFound(_) => true,
            Error::FinalizerError(_) => true,
            Error::PermanentError(_) => false,
            Error::ValidationError(_) => false,
            Error::IdentityConflict { .. } => false,
            Error::AdoptionAmbiguous(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// Terminal errors are surfaced as `ACK.Terminal` and wait for a spec change
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ValidationError(_)
                | Error::IdentityConflict { .. }
                | Error::AdoptionAmbiguous(_)
                | Error::PermanentError(_)
        )
    }

    /// Remote or cluster object is missing
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Aws(e) => e.is_not_found(),
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }

    /// Short machine-readable reason used in conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubernetesError",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::NotFound(_) => "NotFound",
            Error::FinalizerError(_) => "FinalizerError",
            Error::ValidationError(_) => "ValidationError",
            Error::Aws(e) => e.kind.as_str(),
            Error::DependencyNotReady(_) => "DependencyNotReady",
            Error::IdentityConflict { .. } => "IdentityConflict",
            Error::AdoptionAmbiguous(_) => "AdoptionAmbiguous",
            Error::TransientError(_) => "Transient",
            Error::PermanentError(_) => "Permanent",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a reconcile reacts to a failed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Return the error so the error policy requeues with backoff
    Retry,
    /// Requeue after the cooldown (`max_delay`)
    Cooldown,
    /// Wait for the resource to change
    AwaitChange,
}

impl Error {
    /// Default reaction to this error
    pub fn failure_action(&self) -> FailureAction {
        match self {
            // The other owner may go away
            Error::IdentityConflict { .. } => FailureAction::Cooldown,
            e if e.is_terminal() => FailureAction::AwaitChange,
            e if e.is_retryable() => FailureAction::Retry,
            _ => FailureAction::Cooldown,
        }
    }
}

impl FailureAction {
    /// Whether the failure is reported as `ACK.Terminal` rather than `ACK.Recoverable`
    pub fn is_terminal(&self) -> bool {
        *self != FailureAction::Retry
    }

    /// How long the next pass is held off; `None` holds it until the spec changes
    pub fn retry_after(
        &self,
        error: &Error,
        retry_count: u32,
        backoff: &BackoffConfig,
    ) -> Option<Duration> {
        match self {
            FailureAction::Retry => Some(backoff.delay_for_error(error, retry_count)),
            FailureAction::Cooldown => Some(backoff.max_delay),
            FailureAction::AwaitChange => None,
        }
    }

    /// Turn a failed pass into the reconcile result
    pub fn into_result(self, error: Error, backoff: &BackoffConfig) -> Result<Action> {
        match self {
            FailureAction::Retry => Err(error),
            FailureAction::Cooldown => Ok(Action::requeue(backoff.max_delay)),
            FailureAction::AwaitChange => Ok(Action::await_change()),
        }
    }
}

/// Requeue delay for a failed reconcile, growing with the persisted retry count
pub fn requeue_after_error(
    name: &str,
    retry_count: u32,
    error: &Error,
    backoff: &BackoffConfig,
) -> Action {
    let delay = backoff.delay_for_error(error, retry_count);
    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {}, requeuing in {:?} (retry {})",
            name, error, delay, retry_count
        );
    } else {
        error!(
            "Non-retryable error for {}: {}, requeuing in {:?}",
            name, error, delay
        );
    }
    Action::requeue(delay)
}

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries, also the cooldown for terminal errors
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_delay)
    }

    /// Retryable errors back off exponentially; everything else waits out the cooldown
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
