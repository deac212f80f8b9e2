//! Error types for the autoscaler components
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries enough context (autoscaler name, namespace, selector) to
//! identify the unit of work that failed. A failure on one autoscaler never
//! aborts the remainder of a control-loop tick.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for autoscaler operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid autoscaler configuration (bad targetRef, unparsable
    /// apiVersion, unfetchable selector)
    #[error("configuration error for {mpa}: {message}")]
    Configuration {
        /// namespace/name of the autoscaler with invalid configuration
        mpa: String,
        /// Description of what's invalid
        message: String,
    },

    /// No QPS samples were available for any pod matched by the selector
    #[error("no metrics for pods matching {selector} in {namespace}")]
    MissingMetric {
        /// Namespace that was queried
        namespace: String,
        /// Selector that matched no metric samples
        selector: String,
    },

    /// Malformed admission request (not JSON, or not a v1 pod)
    #[error("admission contract error: {message}")]
    Contract {
        /// Description of the contract violation
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "store", "discovery")
        context: String,
    },
}

impl Error {
    /// Create a configuration error without autoscaler context
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            mpa: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for a specific autoscaler
    pub fn configuration_for(mpa: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            mpa: mpa.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-metric error
    pub fn missing_metric(namespace: impl Into<String>, selector: impl Into<String>) -> Self {
        Self::MissingMetric {
            namespace: namespace.into(),
            selector: selector.into(),
        }
    }

    /// Create an admission contract error
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::Contract {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
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

    /// Check if this error is retryable on the next tick
    ///
    /// Configuration and contract errors require a user fix. Kubernetes
    /// errors retry unless the server answered with a 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::Configuration { .. } => false,
            Error::MissingMetric { .. } => true,
            Error::Contract { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the autoscaler name if this error is associated with one
    pub fn mpa(&self) -> Option<&str> {
        match self {
            Error::Configuration { mpa, .. } => Some(mpa),
            _ => None,
        }
    }
}
