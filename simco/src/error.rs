//! Error types for the coordinator crate.

use thiserror::Error;

/// Errors raised by the coordinator and its components.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A caller-supplied value is out of contract (zero period, unknown
    /// module, malformed address).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The registry service could not be brought up or answered.
    #[error("registry service error: {0}")]
    Registry(String),

    /// A module process could not be spawned or terminated.
    #[error("process service error: {0}")]
    Process(String),

    /// A module connection could not be established.
    #[error("connection error to {addr}: {reason}")]
    Connection { addr: String, reason: String },

    /// Configuration loading/validation failure.
    #[error(transparent)]
    Config(#[from] simco_common::config::ConfigError),

    /// Shared-memory failure.
    #[error(transparent)]
    Shm(#[from] simco_shm::ShmError),

    /// IO error.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
