//! Error types for the volume binder
//!
//! Provides structured error types for the object store adapters, the
//! binder state machine, volume plugins and the operator surface.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict writing {kind}/{name}: object was modified since it was read")]
    Conflict { kind: String, name: String },

    #[error("Watch for {kind} expired at version {version}")]
    Expired { kind: String, version: String },

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("Invalid {kind} {name}: {reason}")]
    InvalidObject {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Binder Errors
    // =========================================================================
    #[error("Volume {volume} is pre-bound to claim {claim} which no longer exists")]
    PermanentMismatch { volume: String, claim: String },

    #[error("Gave up on {kind}/{name} after {attempts} conflicting writes")]
    RetryBudgetExhausted {
        kind: String,
        name: String,
        attempts: u32,
    },

    // =========================================================================
    // Plugin Errors
    // =========================================================================
    #[error("Provisioning failed for claim {claim}: {reason}")]
    ProvisioningFailed { claim: String, reason: String },

    #[error("No plugin registered for provisioner {provisioner}")]
    ProvisionerNotFound { provisioner: String },

    #[error("No plugin can {operation} volume {volume}")]
    PluginNotFound { volume: String, operation: String },

    #[error("Reclaim of volume {volume} failed: {reason}")]
    ReclaimFailed { volume: String, reason: String },

    #[error("Plugin {plugin} does not support {operation}")]
    Unsupported { plugin: String, operation: String },

    // =========================================================================
    // Transport / Parse Errors
    // =========================================================================
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a `NotFound` error for a resource kind
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Build a `Conflict` error for a resource kind
    pub fn conflict(kind: &str, name: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::StoreUnavailable(_)
            | Error::Conflict { .. }
            | Error::Expired { .. }
            | Error::RetryBudgetExhausted { .. }
            | Error::Http(_)
            | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Plugin failures are paced by their own backoff bookkeeping
            Error::ProvisioningFailed { .. } | Error::ReclaimFailed { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(10))
            }

            // Missing plugin may be registered later
            Error::ProvisionerNotFound { .. } | Error::PluginNotFound { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Terminal until the object itself changes
            Error::Configuration(_)
            | Error::InvalidSelector(_)
            | Error::CapacityParse(_)
            | Error::InvalidObject { .. }
            | Error::PermanentMismatch { .. }
            | Error::Unsupported { .. }
            | Error::AlreadyExists { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::StoreUnavailable(_)
                | Error::Conflict { .. }
                | Error::Http(_)
                | Error::Io(_)
        )
    }

    /// Optimistic-concurrency rejection
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::conflict("Volume", "pv-1");
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
        assert!(err.is_conflict());

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::ProvisionerNotFound {
            provisioner: "example.com/nfs".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::StoreUnavailable("connection reset".into());
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let mismatch = Error::PermanentMismatch {
            volume: "pv-1".into(),
            claim: "default/claim-1".into(),
        };
        assert!(!mismatch.is_retryable());
        assert!(!mismatch.is_transient());
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::not_found("Claim", "default/a").is_not_found());
        assert!(Error::AlreadyExists {
            kind: "Volume".into(),
            name: "pv-1".into()
        }
        .is_already_exists());
        assert!(!Error::Internal("x".into()).is_conflict());
    }
}
