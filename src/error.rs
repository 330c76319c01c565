//! Session error taxonomy.
//!
//! Every error is local to the session that raised it; the listener only
//! logs it and keeps accepting.

use std::fmt;
use std::io;
use std::time::Duration;

/// Malformed handshake or payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// First line was not `HELLO`.
    BadHandshake(String),
    /// A token that should have been a decimal integer.
    InvalidNumber { line: usize, token: String },
    /// Dimension line missing, zero, or otherwise unusable.
    InvalidDimension(String),
    /// Dimension above the configured maximum.
    DimensionTooLarge { dim: usize, max: usize },
    /// A matrix row with the wrong number of values.
    RowLength {
        line: usize,
        expected: usize,
        found: usize,
    },
    /// Line is not valid UTF-8.
    MalformedLine(usize),
    /// Bytes after the worker count line.
    TrailingData,
    /// Payload exceeded the configured byte limit before completing.
    PayloadTooLarge(usize),
    /// Peer went quiet for longer than the read deadline.
    Timeout(Duration),
    /// Peer closed the stream mid-message.
    UnexpectedEof,
    /// The server answered with an `ERROR` line instead of a result.
    ErrorReply(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadHandshake(got) => write!(f, "expected HELLO, got '{got}'"),
            ProtocolError::InvalidNumber { line, token } => {
                write!(f, "line {line}: invalid integer '{token}'")
            }
            ProtocolError::InvalidDimension(got) => write!(f, "invalid dimension '{got}'"),
            ProtocolError::DimensionTooLarge { dim, max } => {
                write!(f, "dimension {dim} exceeds maximum {max}")
            }
            ProtocolError::RowLength {
                line,
                expected,
                found,
            } => write!(f, "line {line}: expected {expected} values, found {found}"),
            ProtocolError::MalformedLine(line) => write!(f, "line {line}: malformed"),
            ProtocolError::TrailingData => write!(f, "unexpected data after worker count"),
            ProtocolError::PayloadTooLarge(limit) => {
                write!(f, "payload exceeds {limit} bytes")
            }
            ProtocolError::Timeout(after) => write!(f, "read timed out after {after:?}"),
            ProtocolError::UnexpectedEof => write!(f, "connection closed mid-message"),
            ProtocolError::ErrorReply(reason) => write!(f, "server replied: {reason}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Invalid request parameters, rejected before any compute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Worker count must be at least one.
    InvalidWorkerCount(i64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidWorkerCount(w) => {
                write!(f, "worker count must be positive, got {w}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Failure during the parallel addition. No partial result survives one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// Operands have different dimensions.
    ShapeMismatch { left: usize, right: usize },
    /// Plan does not cover the matrix rows exactly.
    PlanMismatch { rows: usize },
    /// Element sum does not fit in an i64.
    Overflow { row: usize, col: usize },
    /// A worker thread could not be started.
    Spawn(String),
    /// A worker thread panicked.
    WorkerPanicked,
    /// Compute exceeded its deadline and was abandoned.
    Timeout(Duration),
    /// The blocking task running the workers was cancelled.
    Aborted,
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::ShapeMismatch { left, right } => {
                write!(f, "operand dimensions differ: {left} vs {right}")
            }
            ComputeError::PlanMismatch { rows } => {
                write!(f, "chunk plan does not cover {rows} rows")
            }
            ComputeError::Overflow { row, col } => {
                write!(f, "integer overflow at ({row}, {col})")
            }
            ComputeError::Spawn(e) => write!(f, "failed to start worker: {e}"),
            ComputeError::WorkerPanicked => write!(f, "worker panicked"),
            ComputeError::Timeout(after) => write!(f, "compute timed out after {after:?}"),
            ComputeError::Aborted => write!(f, "compute task aborted"),
        }
    }
}

impl std::error::Error for ComputeError {}

/// Anything that ends a session without a result.
#[derive(Debug)]
pub enum SessionError {
    Protocol(ProtocolError),
    Config(ConfigError),
    Compute(ComputeError),
    Io(io::Error),
}

impl SessionError {
    /// Short category name used in the `ERROR` reply and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Protocol(_) => "protocol",
            SessionError::Config(_) => "config",
            SessionError::Compute(_) => "compute",
            SessionError::Io(_) => "io",
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Protocol(e) => write!(f, "protocol error: {e}"),
            SessionError::Config(e) => write!(f, "config error: {e}"),
            SessionError::Compute(e) => write!(f, "compute error: {e}"),
            SessionError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Protocol(e) => Some(e),
            SessionError::Config(e) => Some(e),
            SessionError::Compute(e) => Some(e),
            SessionError::Io(e) => Some(e),
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::Config(e)
    }
}

impl From<ComputeError> for SessionError {
    fn from(e: ComputeError) -> Self {
        SessionError::Compute(e)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_kind() {
        let e: SessionError = ProtocolError::TrailingData.into();
        assert_eq!(e.kind(), "protocol");
        let e: SessionError = ConfigError::InvalidWorkerCount(0).into();
        assert_eq!(e.kind(), "config");
        assert_eq!(e.to_string(), "config error: worker count must be positive, got 0");
    }
}
