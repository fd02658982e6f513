use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of the underlying transport. Any of these moves a session to
/// [`crate::session::SessionState::Errored`]; sessions never retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),
    /// The connection was reset mid-session.
    #[error("connection reset: {0}")]
    Reset(String),
    /// Connecting took longer than the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The peer closed the connection while the session was still active.
    #[error("connection closed by peer")]
    ClosedByPeer,
    /// Any other I/O level failure.
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// An inbound payload that could not be understood.
///
/// Whether these are counted or dropped is decided per scenario by
/// [`crate::session::MalformedPolicy`]; they are never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("payload is not a json message: {0}")]
    InvalidJson(String),
    #[error("message of type `{kind}` is missing field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
}

/// A threshold expression that failed to parse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid threshold `{expr}`: {reason}")]
pub struct ThresholdParseError {
    pub expr: String,
    pub reason: String,
}

impl ThresholdParseError {
    pub(crate) fn new(expr: &str, reason: impl Into<String>) -> Self {
        Self {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading a scenario description.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Threshold(#[from] ThresholdParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown workload `{0}`")]
    UnknownWorkload(String),
    #[error("scheduler task failed: {0}")]
    Scheduler(String),
}
