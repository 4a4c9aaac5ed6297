use thiserror::Error;

/// Result type for file store operations
pub type FileStoreResult<T> = Result<T, FileStoreError>;

/// Errors that can occur while storing, streaming or assembling files
#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("Object not found: {locator}")]
    NotFound { locator: String },

    #[error("Chunk {chunk_number} is not valid for this transfer (must be 1-{total_chunks})")]
    InvalidChunkNumber { chunk_number: u32, total_chunks: u32 },

    #[error("Transfer already complete: {locator}")]
    TransferAlreadyComplete { locator: String },

    #[error("Transfer not found: {locator}")]
    TransferNotFound { locator: String },

    #[error("Sizes don't match: expected {expected} bytes but assembled {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Hashes don't match: expected {expected} but calculated {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Transfer record for {locator} was modified concurrently (expected version {expected})")]
    StaleRecord { locator: String, expected: u64 },

    #[error("I/O error during {operation} of '{locator}': {source}")]
    Io {
        operation: &'static str,
        locator: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend error during {operation} of '{locator}': {source}")]
    Backend {
        operation: &'static str,
        locator: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Operation not supported by this backend: {operation}")]
    Unsupported { operation: &'static str },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl FileStoreError {
    /// Create a not found error
    pub fn not_found<S: Into<String>>(locator: S) -> Self {
        Self::NotFound {
            locator: locator.into(),
        }
    }

    /// Wrap an I/O failure with the operation and target locator
    pub fn io<S: Into<String>>(operation: &'static str, locator: S, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            locator: locator.into(),
            source,
        }
    }

    /// Wrap any backend failure with the operation and target locator
    pub fn backend<S, E>(operation: &'static str, locator: S, error: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            operation,
            locator: locator.into(),
            source: Box::new(error),
        }
    }

    /// Backend failure described only by a message
    pub fn backend_message<S: Into<String>, M: Into<String>>(
        operation: &'static str,
        locator: S,
        message: M,
    ) -> Self {
        Self::backend(
            operation,
            locator,
            std::io::Error::new(std::io::ErrorKind::Other, message.into()),
        )
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// True for failures that invalidate an in-flight assembly and force
    /// the transfer to start over.
    pub fn resets_transfer(&self) -> bool {
        matches!(
            self,
            Self::SizeMismatch { .. }
                | Self::HashMismatch { .. }
                | Self::NotFound { .. }
                | Self::Io { .. }
                | Self::Backend { .. }
        )
    }

    /// True for socket-level failures talking to a tracker that are worth
    /// one reconnect and retry.
    pub fn is_retryable_socket(&self) -> bool {
        match self {
            Self::Io { source, .. } => is_transient_socket_error(source),
            Self::Backend { source, .. } => source
                .downcast_ref::<std::io::Error>()
                .map_or(false, is_transient_socket_error),
            _ => false,
        }
    }
}

fn is_transient_socket_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::TimedOut
    )
}
