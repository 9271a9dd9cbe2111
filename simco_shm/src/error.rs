//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment already exists
    #[error("segment already exists: {name}")]
    AlreadyExists {
        /// Segment name
        name: String,
    },

    /// Segment not found
    #[error("segment not found: {name}")]
    NotFound {
        /// Segment name
        name: String,
    },

    /// Invalid segment size
    #[error("invalid segment size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Segment header failed validation on attach
    #[error("segment {name} carries an invalid header")]
    InvalidHeader {
        /// Segment name
        name: String,
    },

    /// Topic has no declared publish size
    #[error("topic {topic} has no declared shared-memory publication")]
    UnknownTopic {
        /// Topic name
        topic: String,
    },

    /// One or more segments could not be removed during reconciliation
    #[error("failed to remove {failed} segment(s) of topic {topic}")]
    RemovalFailed {
        /// Topic name
        topic: String,
        /// Number of segments whose removal failed
        failed: usize,
    },

    /// IO error
    #[error("io error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
