//! Error types for the stream processor.

use std::path::PathBuf;

/// Result type alias for stream processor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while restricting, fetching options, or converting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Privilege Errors
    // =========================================================================
    /// Privilege name not recognized by the operating system.
    #[error("unknown privilege: {name}")]
    UnknownPrivilege { name: String },

    /// Opening the current process token failed.
    #[error("failed to open process token: {reason}")]
    TokenOpenFailed { reason: String },

    /// Querying the privileges held by a token failed.
    #[error("failed to query token privileges: {reason}")]
    TokenQueryFailed { reason: String },

    /// Deriving the restricted token (or capability set) failed.
    #[error("failed to create restricted token: {reason}")]
    RestrictedTokenFailed { reason: String },

    // =========================================================================
    // Channel Errors
    // =========================================================================
    /// Connecting to the payload channel failed.
    #[error("failed to dial payload channel '{address}': {source}")]
    ChannelDial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the payload from a connected channel failed.
    #[error("failed to read payload channel '{address}': {source}")]
    ChannelRead {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The dial context was cancelled.
    #[error("operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Payload exceeds the size limit.
    #[error("payload exceeds size limit: {size} > {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// The envelope or the message inside it could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The envelope holds a different message than the caller expects.
    #[error("invalid payload type: expected '{expected}', got '{actual}'")]
    InvalidPayloadType { expected: String, actual: String },

    /// The envelope's type URL names no known options message.
    #[error("unknown payload type: {0}")]
    UnknownPayloadType(String),

    // =========================================================================
    // Media Type Errors
    // =========================================================================
    /// Media type string cannot be parsed.
    #[error("invalid media type '{media_type}': {reason}")]
    InvalidMediaType { media_type: String, reason: String },

    // =========================================================================
    // Conversion Errors
    // =========================================================================
    /// A conversion step failed.
    #[error("{operation}: {source}")]
    Conversion {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// A required option was absent from the payload.
    #[error("missing required option: {option}")]
    MissingOption { option: &'static str },

    /// An option is present but its value is unusable.
    #[error("invalid option {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    /// Layer path escapes the destination.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Parent layer path does not exist or is not a directory.
    #[error("invalid parent layer {path}: {reason}")]
    InvalidParentLayer { path: PathBuf, reason: String },

    /// Layer exceeds extraction limits.
    #[error("layer exceeds {what} limit: {size} > {limit}")]
    LayerTooLarge {
        what: &'static str,
        size: u64,
        limit: u64,
    },

    /// Stream compression is not supported.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// Spawning the restricted child failed.
    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    /// Waiting for the restricted child failed.
    #[error("failed to wait for child process: {0}")]
    WaitFailed(String),

    /// Operation not supported on this platform.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps an I/O error with the name of the conversion step that failed.
    pub fn conversion(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Conversion {
            operation: operation.into(),
            source,
        }
    }

    /// Returns true if this error means the caller gave up waiting.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::Timeout { .. })
    }
}
