//! Error types for the instance lifecycle core
//!
//! Two kinds of failure flow through every operation: request-caused errors
//! (kept verbatim for the caller) and opaque infrastructure failures
//! (logged in full server-side, surfaced generically). `Error::is_internal`
//! is the split every aggregation point relies on.

use thiserror::Error;

use crate::lock::LockError;
use crate::provision::ProvisionError;
use crate::store::StoreError;

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by lifecycle operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Transient coordination failure; the caller may retry.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("invalid scenario: {0}")]
    ScenarioInvalid(String),

    #[error("renew not allowed: {0}")]
    RenewNotAllowed(String),

    #[error("instance expired")]
    InstanceExpired,

    /// Combined request-caused failures from a fan-out.
    #[error("{0}")]
    Multiple(String),

    /// Opaque infrastructure failure. Display stays generic; the detail is
    /// carried for server-side logging only.
    #[error("internal error")]
    Internal(String),
}

impl Error {
    /// Build an internal error, logging the full detail at the point of
    /// origin so the generic surface loses nothing server-side.
    pub fn internal(operation: &str, detail: impl std::fmt::Display) -> Self {
        let detail = detail.to_string();
        tracing::error!(operation, detail = %detail, "internal error");
        Error::Internal(detail)
    }

    /// Whether this error must be hidden behind a generic message.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }

    /// Full detail for server-side logs; identical to Display for
    /// request-caused errors.
    pub fn detail(&self) -> String {
        match self {
            Error::Internal(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Unavailable(reason) => Error::LockUnavailable(reason),
            LockError::Misuse { key, reason } => {
                Error::internal("lock", format!("misuse on {key}: {reason}"))
            }
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::internal("store", err)
    }
}

impl From<ProvisionError> for Error {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Scenario(reason) => Error::ScenarioInvalid(reason),
            ProvisionError::Failed(reason) => Error::ProvisioningFailed(reason),
            ProvisionError::Internal(detail) => Error::internal("provisioner", detail),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal("io", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::internal("serialization", err)
    }
}

/// Collapse per-worker results into one outcome.
///
/// All workers have already run to completion when this is called. Internal
/// failures take precedence and collapse to a single generic error;
/// request-caused failures are combined verbatim; otherwise the collected
/// values are returned.
pub fn aggregate<R>(operation: &str, results: Vec<Result<R>>) -> Result<Vec<R>> {
    let mut values = Vec::with_capacity(results.len());
    let mut user_errors: Vec<Error> = Vec::new();
    let mut internal_detail: Vec<String> = Vec::new();

    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) if err.is_internal() => internal_detail.push(err.detail()),
            Err(err) => user_errors.push(err),
        }
    }

    if !internal_detail.is_empty() {
        tracing::error!(
            operation,
            failures = internal_detail.len(),
            detail = %internal_detail.join("; "),
            "fan-out completed with internal failures"
        );
        return Err(Error::Internal(internal_detail.join("; ")));
    }

    match user_errors.len() {
        0 => Ok(values),
        1 => Err(user_errors.remove(0)),
        _ => Err(Error::Multiple(
            user_errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_display_is_generic() {
        let err = Error::Internal("etcd exploded at 10.0.0.3:2379".to_string());
        assert_eq!(err.to_string(), "internal error");
        assert!(err.detail().contains("exploded"));
    }

    #[test]
    fn test_user_errors_keep_their_reason() {
        let err = Error::NotFound("chall/web-intro".to_string());
        assert_eq!(err.to_string(), "not found: chall/web-intro");
        assert!(!err.is_internal());
    }

    #[test]
    fn test_lock_error_conversion() {
        let err: Error = LockError::Unavailable("connection refused".to_string()).into();
        assert!(matches!(err, Error::LockUnavailable(_)));
        assert!(!err.is_internal());
    }

    #[test]
    fn test_provision_error_conversion() {
        let scenario: Error = ProvisionError::Scenario("missing manifest".to_string()).into();
        assert!(matches!(scenario, Error::ScenarioInvalid(_)));

        let internal: Error = ProvisionError::Internal("engine panic".to_string()).into();
        assert!(internal.is_internal());
    }

    #[test]
    fn test_aggregate_all_ok() {
        let results: Vec<Result<u32>> = vec![Ok(1), Ok(2), Ok(3)];
        assert_eq!(aggregate("test", results).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_aggregate_single_user_error_passes_through() {
        let results: Vec<Result<u32>> =
            vec![Ok(1), Err(Error::NotFound("gone".to_string()))];
        let err = aggregate("test", results).unwrap_err();
        assert_eq!(err.to_string(), "not found: gone");
    }

    #[test]
    fn test_aggregate_combines_user_errors() {
        let results: Vec<Result<u32>> = vec![
            Err(Error::ProvisioningFailed("stack a".to_string())),
            Err(Error::ProvisioningFailed("stack b".to_string())),
        ];
        let err = aggregate("test", results).unwrap_err();
        assert!(matches!(err, Error::Multiple(_)));
        let message = err.to_string();
        assert!(message.contains("stack a"));
        assert!(message.contains("stack b"));
    }

    #[test]
    fn test_aggregate_internal_wins() {
        let results: Vec<Result<u32>> = vec![
            Err(Error::ProvisioningFailed("user-visible".to_string())),
            Err(Error::Internal("disk on fire".to_string())),
        ];
        let err = aggregate("test", results).unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.to_string(), "internal error");
    }
}
