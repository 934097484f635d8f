//! Error types for route registration.

use thiserror::Error;

/// Errors raised while turning a container into a route or while
/// persisting that route to a registry backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A backend is selected but its configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The container does not carry the labels required for registration.
    /// This is a legitimate skip rather than a failure.
    #[error("container {0} is not enabled for gateway registration")]
    NotEnabled(String),

    /// A distributed lock is already held by another session.
    #[error("lock {0} is already held by another session")]
    LockContention(String),

    /// The route to deregister does not exist in the store.
    #[error("route {0} not found, nothing deregistered")]
    NotFound(String),

    /// A stored route with this id has a shape we cannot merge into.
    #[error("route {0} is not in a shape turu manages, left untouched")]
    Unmanaged(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Read or write against the distributed store failed.
    #[error("store error: {0}")]
    Store(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<etcd_client::Error> for RegistryError {
    fn from(err: etcd_client::Error) -> Self {
        RegistryError::Store(err.to_string())
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
