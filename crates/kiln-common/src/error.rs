//! Error types for kiln
//!
//! Errors carry the context needed to act on them: the host a script failed
//! on, the provider that rejected a call, the operation that ran out of
//! attempts. Callers branch on [`ErrorKind`], never on provider-native errors.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kiln operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid user input (names, counts, versions, regions)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field, if known (e.g. "name", "controlplane")
        field: Option<String>,
    },

    /// No credentials available for a provider
    #[error("no credentials found for {provider}")]
    NilCredentials {
        /// Provider the credentials were requested for
        provider: String,
    },

    /// Record already exists (cluster, credentials, cloud resource)
    #[error("duplicate record: {message}")]
    DuplicateRecords {
        /// What already exists
        message: String,
    },

    /// Record was expected but is absent
    #[error("no matching records found: {message}")]
    NoMatchingRecords {
        /// What was looked up
        message: String,
    },

    /// Cloud account authentication failed
    #[error("cloud authentication failed for {provider}: {message}")]
    CloudAuth {
        /// Provider that rejected the credentials
        provider: String,
        /// Description of the failure
        message: String,
    },

    /// Cloud provider API error
    #[error("provider error [{provider}]: {message}")]
    Provider {
        /// Provider that returned the error
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// SSH transport failure: bad key, dial exhaustion, fingerprint mismatch
    #[error("ssh transport error for {host}: {message}")]
    Transport {
        /// Remote host address
        host: String,
        /// Description of what failed
        message: String,
    },

    /// Remote script exited unsuccessfully
    #[error("remote command '{script}' failed on {host}: {message}")]
    RemoteCommand {
        /// Remote host address
        host: String,
        /// Script name
        script: String,
        /// Failure reason (stderr, exit status)
        message: String,
    },

    /// Bounded retry loop ran out of attempts
    #[error("{operation} timed out after {attempts} attempts: {reason}")]
    Timeout {
        /// Operation being retried
        operation: String,
        /// Number of action invocations made
        attempts: u32,
        /// Last observed failure, or "max retries exceeded"
        reason: String,
        /// The last observed failure
        #[source]
        source: Option<Box<Error>>,
    },

    /// Operation was cancelled through its cancellation token
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that observed the cancellation
        operation: String,
    },

    /// Persisted state is missing a field or is corrupt
    #[error("state error: {message}")]
    State {
        /// Description of what's wrong
        message: String,
    },

    /// Kubeconfig could not be fetched or rewritten
    #[error("kubeconfig error: {message}")]
    Kubeconfig {
        /// Description of what failed
        message: String,
    },

    /// Certificate or key generation failed
    #[error("certificate error: {message}")]
    Certificate {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Filesystem error
    #[error("io error: {source}")]
    Io {
        /// The underlying io error
        #[from]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "orchestrator", "store")
        context: String,
    },
}

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Record already exists
    DuplicateRecord,
    /// Input rejected before any remote call
    InvalidArgument,
    /// Credentials missing or rejected
    AuthFailure,
    /// Record absent
    NotFound,
    /// SSH transport failure
    Transport,
    /// Remote script failure
    RemoteCommand,
    /// Retry budget exhausted
    Timeout,
    /// Cancellation observed
    Cancelled,
    /// Persisted state missing or corrupt
    State,
    /// Everything else
    Internal,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a credentials-missing error
    pub fn nil_credentials(provider: impl Into<String>) -> Self {
        Self::NilCredentials {
            provider: provider.into(),
        }
    }

    /// Create a duplicate-record error
    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::DuplicateRecords {
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NoMatchingRecords {
            message: msg.into(),
        }
    }

    /// Create a cloud authentication error
    pub fn cloud_auth(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CloudAuth {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable provider error
    pub fn provider_for(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g. quota, bad argument)
    pub fn provider_permanent(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an SSH transport error
    pub fn transport(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a remote command error
    pub fn remote_command(
        host: impl Into<String>,
        script: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::RemoteCommand {
            host: host.into(),
            script: script.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error wrapping the last failure, if any
    pub fn timeout(operation: impl Into<String>, attempts: u32, last: Option<Error>) -> Self {
        let reason = last
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "max retries exceeded".to_string());
        Self::Timeout {
            operation: operation.into(),
            attempts,
            reason,
            source: last.map(Box::new),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State {
            message: msg.into(),
        }
    }

    /// Create a kubeconfig error
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            message: msg.into(),
        }
    }

    /// Create a certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::InvalidArgument,
            Error::NilCredentials { .. } | Error::CloudAuth { .. } => ErrorKind::AuthFailure,
            Error::DuplicateRecords { .. } => ErrorKind::DuplicateRecord,
            Error::NoMatchingRecords { .. } => ErrorKind::NotFound,
            Error::Provider { retryable, .. } => {
                if *retryable {
                    ErrorKind::Internal
                } else {
                    ErrorKind::InvalidArgument
                }
            }
            Error::Transport { .. } => ErrorKind::Transport,
            Error::RemoteCommand { .. } => ErrorKind::RemoteCommand,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::State { .. } | Error::Serialization { .. } => ErrorKind::State,
            Error::Kubeconfig { .. }
            | Error::Certificate { .. }
            | Error::Io { .. }
            | Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable
    ///
    /// Transport failures, auth failures, cancellation and bad input are never
    /// retried. Provider errors carry their own flag.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { retryable, .. } => *retryable,
            Error::RemoteCommand { .. } | Error::Io { .. } | Error::Internal { .. } => true,
            Error::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Cluster Operations
    // ==========================================================================

    /// Story: bad input is rejected before anything is provisioned
    #[test]
    fn story_validation_stops_cluster_creation_early() {
        let err = Error::validation_for_field("controlplane", "must be odd and at least 3");
        assert!(err.to_string().contains("validation error"));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!err.is_retryable());

        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("controlplane")),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: a creation retry of a finished cluster is refused
    #[test]
    fn story_duplicate_cluster_is_reported_not_retried() {
        let err = Error::duplicate("cluster demo in lon1 already exists");
        assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("demo"));
    }

    /// Story: fingerprint mismatch and auth failures are never retried
    #[test]
    fn story_security_failures_are_fatal() {
        let err = Error::transport("10.0.0.4", "mismatch of SSH fingerprint");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!err.is_retryable());

        let err = Error::cloud_auth("civo", "token rejected");
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert!(!err.is_retryable());
    }

    /// Story: exhausted retries keep the last failure as the source
    #[test]
    fn story_timeout_wraps_last_failure() {
        let last = Error::provider_for("civo", "instance still BUILDING");
        let err = Error::timeout("watch instance", 4, Some(last));
        assert!(err.to_string().contains("instance still BUILDING"));
        assert!(std::error::Error::source(&err).is_some());

        let err = Error::timeout("watch instance", 4, None);
        assert!(err.to_string().contains("max retries exceeded"));
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn cancellation_is_its_own_kind() {
        let err = Error::cancelled("network watch");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!err.is_retryable());
    }

    #[test]
    fn provider_retry_flag_drives_classification() {
        assert!(Error::provider_for("aws", "throttled").is_retryable());
        let permanent = Error::provider_permanent("aws", "invalid region");
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::State);
    }
}
