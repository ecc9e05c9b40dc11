use std::fmt;
use thiserror::Error;

/// Failure to get a child process onto a PTY.
///
/// Distinct from [`AgentError`]: a spawn failure never produces a
/// `PtyProcess` to register, so the caller only has a reason string.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open pty: {0}")]
    OpenPty(String),
    #[error("failed to spawn child: {0}")]
    Spawn(String),
    #[error("could not obtain child pid")]
    NoPid,
    #[error("failed to take pty writer: {0}")]
    TakeWriter(String),
    #[error("failed to clone pty reader: {0}")]
    CloneReader(String),
}

/// Errors surfaced while servicing a single request.
///
/// These never propagate out of the mainloop; handlers turn them into an
/// `end <id> <status>` line (see `protocol::Writer`) rather than raising.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("process {0} not found")]
    ProcessNotFound(i32),
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid pid: {0}")]
    InvalidPid(std::num::ParseIntError),
}

/// Reason a request was rejected before any `begin`/`end` envelope could be
/// emitted (argument errors), or a protocol violation (unknown verb).
///
/// Both map to `abort <reason>` plus a non-zero exit status: a dedicated
/// fatal path used as an early-exit control-flow primitive.
#[derive(Debug)]
pub struct FatalError(pub String);

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for FatalError {}

impl FatalError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<&str> for FatalError {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

impl From<String> for FatalError {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}
