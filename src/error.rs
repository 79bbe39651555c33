//! Error types for the application probe
//!
//! Errors are structured with fields so the reporting layer can name the
//! affected resource, the elapsed wait, and the last observed state without
//! re-parsing message strings.

use std::time::Duration;

use thiserror::Error;

/// Main error type for probe operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Creation was rejected because an object with the same name exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind (e.g. "Pod")
        kind: String,
        /// Name of the conflicting object
        name: String,
    },

    /// The change-event subscription reported an error
    #[error("watch error for {kind}: {message}")]
    Watch {
        /// Resource kind being watched
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// A readiness deadline elapsed before the predicate was satisfied
    #[error(
        "timed out after {}s waiting for {resource} to become {condition} (last observed: {last_observed})",
        waited.as_secs_f64()
    )]
    ReadinessTimeout {
        /// Resource being waited on (e.g. "pod/diagnostic-appcreate")
        resource: String,
        /// Condition that was never reached (e.g. "Running")
        condition: String,
        /// How long the wait lasted
        waited: Duration,
        /// Last state the readiness predicate saw
        last_observed: String,
    },

    /// The watched resource reported a state that can never become ready
    #[error("{resource} will not become ready: {message}")]
    Readiness {
        /// Resource being waited on
        resource: String,
        /// Description of the hard failure
        message: String,
    },

    /// Every connectivity attempt failed
    #[error("connection to {url} failed after {attempts} attempt(s): {reason}")]
    Connectivity {
        /// URL that was probed
        url: String,
        /// Number of attempts made
        attempts: u32,
        /// Failure reason of the last attempt
        reason: String,
    },

    /// The run was interrupted before the operation could complete
    #[error("interrupted: {context}")]
    Interrupted {
        /// What was in progress when the interrupt arrived
        context: String,
    },

    /// HTTP client construction error
    #[error("http client error: {source}")]
    Http {
        /// The underlying reqwest error
        #[from]
        source: reqwest::Error,
    },

    /// Invalid probe configuration
    #[error("configuration error for {field}: {message}")]
    Config {
        /// Name of the offending setting
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// The target environment could not be prepared
    #[error("setup error: {message}")]
    Setup {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying serde_json error
        #[from]
        source: serde_json::Error,
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
        /// Context where the error occurred (e.g. "prepare", "cleanup")
        context: String,
    },
}

impl Error {
    /// Create a watch error for the given resource kind
    pub fn watch(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Watch {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a readiness error for the given resource
    pub fn readiness(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Readiness {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for the given setting
    pub fn config(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a setup error with the given message
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup {
            message: msg.into(),
        }
    }

    /// Create an interrupted error naming what was in progress
    pub fn interrupted(context: impl Into<String>) -> Self {
        Self::Interrupted {
            context: context.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error is a readiness deadline rather than a hard failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadinessTimeout { .. })
    }
}
