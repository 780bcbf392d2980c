//! Errors raised by the analysis engine.

use thiserror::Error;

/// Producer-side ring buffer failures. All of them drop the frame; none of
/// them corrupt frames already queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("ring buffer full: frame needs {needed} bytes, {free} free")]
    Full { needed: usize, free: usize },
    #[error("frame of {frame} bytes can never fit a ring of {capacity} bytes")]
    FrameTooLarge { frame: usize, capacity: usize },
    #[error("terminal id of {0} bytes exceeds the frame header limit")]
    IdTooLong(usize),
}

impl RingBufferError {
    /// A full ring drains as the worker catches up; the other variants never succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RingBufferError::Full { .. })
    }
}

/// Failures starting or talking to an analysis worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("failed to start analysis worker: {0}")]
    Spawn(String),
    #[error("analysis worker is gone; {0} was not delivered")]
    Disconnected(&'static str),
}

impl WorkerError {
    pub fn operation(&self) -> &'static str {
        match self {
            WorkerError::Spawn(_) => "spawn",
            WorkerError::Disconnected(_) => "post",
        }
    }
}
