//! Error taxonomy shared across the crate.
//!
//! KV-origin errors are deliberately coarse: serialization conflicts map to
//! [`Error::Conflict`] so the transaction scope can retry them, everything
//! else bubbles through [`Error::Kv`] unchanged for the caller to classify.

/// Errors produced by connections, the record engine, and queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The requested KV client version is not supported by this build.
    UnknownVersion(u16),
    /// Compression or buffer assembly failed.
    MemFail(String),
    /// A packed value carried a malformed gzip stream.
    InvalidGzip(String),
    /// A subscription task panicked; carries the panic payload.
    QueuePanic(String),
    /// The operation was cancelled through its cancellation token.
    Cancelled,
    /// The transaction lost an optimistic-concurrency race and may be retried.
    Conflict,
    /// Any other error reported by the underlying KV.
    Kv(String),
    /// A user-supplied record, fabric, index, or filter function failed.
    Record(String),
    /// Invalid tunables were supplied at connection creation.
    Config(String),
    /// Internal invariant violation.
    Internal(String),
}

impl Error {
    /// True when the enclosing transaction should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict)
    }

    pub(crate) fn mem_fail(err: impl std::fmt::Display) -> Self {
        Error::MemFail(err.to_string())
    }

    pub(crate) fn kv(err: impl std::fmt::Display) -> Self {
        Error::Kv(err.to_string())
    }

    /// Wraps a failure from user-supplied record or fabric code.
    pub fn record(err: impl std::fmt::Display) -> Self {
        Error::Record(err.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownVersion(v) => write!(f, "unsupported KV client version {}", v),
            Error::MemFail(msg) => write!(f, "buffer processing failed: {}", msg),
            Error::InvalidGzip(msg) => write!(f, "invalid gzip stream: {}", msg),
            Error::QueuePanic(msg) => write!(f, "subscription task panicked: {}", msg),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Conflict => write!(f, "transaction conflict"),
            Error::Kv(msg) => write!(f, "kv error: {}", msg),
            Error::Record(msg) => write!(f, "record error: {}", msg),
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
