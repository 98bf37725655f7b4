//! Error types for relaygate

use thiserror::Error;

/// Main error type for relaygate operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Fatal configuration error (missing env, bad flag values)
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// A resource precondition is not met yet; the reconcile is retryable
    #[error("{0}")]
    Precondition(String),

    /// The relay port range [2049, 65536) is exhausted for an allocation key
    #[error("relay port range exhausted for {key}")]
    RelayPortExhausted {
        /// Allocation key (source endpoint and port) that could not be served
        key: String,
    },

    /// NAT rule application error
    #[error("nat error: {0}")]
    Nat(String),

    /// SSH transport error
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// Network I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a NAT error with the given message
    pub fn nat(msg: impl Into<String>) -> Self {
        Self::Nat(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True if the error only signals that the world is not ready yet.
    ///
    /// Precondition failures (forwarder pod without an IP, absent source
    /// service) requeue without advancing any rule generation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Precondition(_) | Self::Kube(_))
    }
}
