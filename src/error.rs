//! Error types for async-conn.
//!
//! All errors are `#[non_exhaustive]` to allow adding new variants without breaking changes.

use std::time::Duration;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O direction, used to attribute deadline expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Configuration error kinds.
///
/// These represent programmer errors: the call is rejected immediately and
/// nothing about the connection changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Timeout durations must be strictly positive.
    ZeroTimeout,
    /// The transport variant cannot apply the requested compression mode.
    CompressionUnsupported {
        transport: &'static str,
        mode: &'static str,
    },
}

impl std::fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroTimeout => write!(f, "timeout must be greater than zero"),
            Self::CompressionUnsupported { transport, mode } => {
                write!(
                    f,
                    "{} transport does not support {} compression",
                    transport, mode
                )
            }
        }
    }
}

/// Library error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O error on a connection.
    #[error("I/O error on connection {conn_id}: {source}")]
    Io {
        conn_id: u32,
        #[source]
        source: std::io::Error,
    },

    /// An armed per-call deadline expired.
    #[error("{direction} timeout on connection {conn_id} after {elapsed:?}")]
    Timeout {
        conn_id: u32,
        direction: Direction,
        elapsed: Duration,
    },

    /// Invalid configuration (programmer error, not recoverable).
    #[error("invalid configuration: {kind}")]
    InvalidConfig { kind: ConfigErrorKind },

    /// Datagram send without a destination on a listener-role endpoint.
    #[error("datagram send on connection {conn_id} requires a destination address")]
    MissingDestination { conn_id: u32 },

    /// Payload shape does not match the transport variant's expectation.
    #[error("payload mismatch: {transport} transport expects {expected}, got {got}")]
    PayloadMismatch {
        transport: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    /// Operation on a connection that has already been closed.
    #[error("connection {conn_id} is closed")]
    Closed { conn_id: u32 },

    /// Compression filter failure.
    #[error("compression filter error on connection {conn_id}: {source}")]
    Compress {
        conn_id: u32,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an I/O error bound to a connection.
    pub fn io(conn_id: u32, source: std::io::Error) -> Self {
        Self::Io { conn_id, source }
    }

    /// Create a deadline-expiry error.
    pub fn timeout(conn_id: u32, direction: Direction, elapsed: Duration) -> Self {
        Self::Timeout {
            conn_id,
            direction,
            elapsed,
        }
    }

    /// Create a configuration error.
    pub fn config(kind: ConfigErrorKind) -> Self {
        Self::InvalidConfig { kind }
    }

    /// Create a compression filter error.
    pub fn compress(conn_id: u32, source: std::io::Error) -> Self {
        Self::Compress { conn_id, source }
    }

    /// Whether this error is an expired deadline.
    ///
    /// Upstream code may interpret an expired deadline as cancellation; no
    /// other cancellation primitive is exposed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The connection id this error is attributed to, if any.
    pub fn conn_id(&self) -> Option<u32> {
        match self {
            Self::Io { conn_id, .. } => Some(*conn_id),
            Self::Timeout { conn_id, .. } => Some(*conn_id),
            Self::MissingDestination { conn_id } => Some(*conn_id),
            Self::Closed { conn_id } => Some(*conn_id),
            Self::Compress { conn_id, .. } => Some(*conn_id),
            _ => None,
        }
    }
}
