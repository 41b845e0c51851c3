//! Error types for VidSeek.

use thiserror::Error;

/// Main error type for VidSeek operations.
#[derive(Error, Debug)]
pub enum VidSeekError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid device selection or mismatched context/stream arguments.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Stream exceeds what the decoder hardware supports.
    #[error("Capability error: {0}")]
    Capability(String),

    /// A requested frame index has no entry in the container index.
    #[error("Invalid frame index: {0}")]
    InvalidIndex(u32),

    /// Container-level seek failed.
    #[error("Seek error: {0}")]
    Seek(String),

    #[error("Stream is not seekable: {0}")]
    NotSeekable(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Demux error: {0}")]
    Demux(String),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for VidSeek operations.
pub type Result<T> = std::result::Result<T, VidSeekError>;
