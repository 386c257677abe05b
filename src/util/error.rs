//! Error types for acceleration structure, dispatch and CLI operations.

use thiserror::Error;

/// Main error type for rtaccel operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A buffer could not be mapped or allocated.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Unknown geometry, vertex or index format, or a host/device address
    /// used where the other kind is required. Callers are expected to
    /// validate descriptors up front.
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A device load or store fell outside every allocation.
    #[error("Invalid device address {address:#x} (len {len})")]
    InvalidAddress { address: u64, len: usize },

    /// Portable blob written by a different build.
    #[error("Serialized acceleration structure is incompatible with this driver")]
    Incompatible,

    /// Shader group references a stage of the wrong kind, or an index is out of range.
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Software call stack or traversal stack exhausted.
    #[error("Stack overflow: {required} bytes required, {available} available")]
    StackOverflow { required: usize, available: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON settings or scene parse error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid descriptor error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    /// Create an out of memory error.
    pub fn oom(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }
}

/// Result type alias for rtaccel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::InvalidAddress { address: 0x1000, len: 16 };
        assert!(e.to_string().contains("0x1000"));

        let e = Error::StackOverflow { required: 96, available: 64 };
        assert!(e.to_string().contains("96"));
        assert!(e.to_string().contains("64"));

        assert!(Error::oom("region").to_string().contains("region"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
