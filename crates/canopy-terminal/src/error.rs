//! PTY errors with the failing operation attached.

use canopy_registry::BridgeError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    Open(String),
    #[error("Failed to spawn process: {0}")]
    Spawn(String),
    #[error("Failed to write to PTY: {0}")]
    Write(String),
    #[error("Failed to read from PTY: {0}")]
    Read(String),
    #[error("Failed to resize PTY: {0}")]
    Resize(String),
    #[error("Failed to signal process: {0}")]
    Kill(String),
}

impl PtyError {
    /// Returns whether this error is potentially transient and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PtyError::Read(_) | PtyError::Write(_))
    }

    pub fn operation(&self) -> &'static str {
        match self {
            PtyError::Open(_) => "open",
            PtyError::Spawn(_) => "spawn",
            PtyError::Write(_) => "write",
            PtyError::Read(_) => "read",
            PtyError::Resize(_) => "resize",
            PtyError::Kill(_) => "kill",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PtyError::Open(r)
            | PtyError::Spawn(r)
            | PtyError::Write(r)
            | PtyError::Read(r)
            | PtyError::Resize(r)
            | PtyError::Kill(r) => r,
        }
    }

    /// A hint for the log line when a spawn fails.
    pub fn suggestion(&self) -> &'static str {
        match self {
            PtyError::Open(_) => {
                "PTY allocation failed. Check system resource limits (ulimit -n)."
            }
            PtyError::Spawn(reason)
                if reason.contains("No such file") || reason.contains("not found") =>
            {
                "Command not found. Check that it exists and is in PATH."
            }
            PtyError::Spawn(reason) if reason.contains("Permission denied") => {
                "Permission denied. Check file permissions."
            }
            PtyError::Spawn(_) => "Process spawn failed. Check command syntax and permissions.",
            PtyError::Write(_) | PtyError::Read(_) => "The terminal process may have exited.",
            PtyError::Resize(_) | PtyError::Kill(_) => "Retry or remove the terminal.",
        }
    }
}

impl From<PtyError> for BridgeError {
    fn from(err: PtyError) -> Self {
        BridgeError::new(err.operation(), err.reason())
    }
}
