//! Error types for the cloud gateway

use thiserror::Error;

/// Main error type for cloud gateway operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing or unusable configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Key material could not be loaded, generated or verified
    #[error("credential error: {0}")]
    Credential(String),

    /// A referenced resource does not exist or is not ready yet
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Transient failure reading or writing the resource store
    #[error("store error: {0}")]
    Store(String),

    /// iptables or route programming failed
    #[error("data plane error: {0}")]
    DataPlane(String),

    /// Tunnel transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Virtual presence allocation failed
    #[error("allocation error: {0}")]
    Allocation(String),

    /// A synchronous send did not receive a reply in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a credential error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a resolution error with the given message
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a data plane error with the given message
    pub fn data_plane(msg: impl Into<String>) -> Self {
        Self::DataPlane(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an allocation error with the given message
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the failed operation should be retried with backoff
    ///
    /// Resolution and validation failures need a change to the resource graph
    /// before a retry can succeed; everything else may recover on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Resolution(_) | Error::Validation(_) | Error::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
