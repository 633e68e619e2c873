//! Error types for cluster module

use thiserror::Error;

use crate::discovery::InstanceKey;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    /// The instance declares no port (or has no address yet), so there is nothing to dial.
    #[error("No endpoint for instance {0}")]
    NoEndpoint(InstanceKey),

    /// A telemetry item carried a runtime id that no registered instance owns.
    #[error("No instance owns runtime id: {0}")]
    CorrelationMiss(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error belongs to a single instance rather than the whole request.
    #[must_use]
    pub const fn is_per_instance(&self) -> bool {
        matches!(self, Self::NoEndpoint(_) | Self::Rpc(_) | Self::Timeout(_))
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Self::Rpc(format!("{}: {}", status.code(), status.message()))
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
