//! Error types for registry, analysis and project-switch operations.

use canopy_core::WorkerError;
use thiserror::Error;

use crate::project_switch::SwitchPhase;

/// A call into the process that owns the PTYs failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("terminal bridge {operation} failed: {reason}")]
pub struct BridgeError {
    pub operation: &'static str,
    pub reason: String,
}

impl BridgeError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Terminal not found: {0}")]
    NotFound(String),
    #[error("Failed to spawn terminal process: {0}")]
    Spawn(#[source] BridgeError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("Persistence error during {operation}: {reason}")]
    Persistence { operation: String, reason: String },
    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),
}

impl RegistryError {
    pub fn persistence(operation: &str, reason: impl std::fmt::Display) -> Self {
        RegistryError::Persistence {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns whether this error is potentially transient and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Spawn(_) | RegistryError::Bridge(_) | RegistryError::Persistence { .. }
        )
    }

    pub fn operation(&self) -> &str {
        match self {
            RegistryError::NotFound(_) => "lookup",
            RegistryError::Spawn(_) => "spawn",
            RegistryError::Bridge(err) => err.operation(),
            RegistryError::Persistence { operation, .. } => operation,
            RegistryError::InvalidPlacement(_) => "placement",
        }
    }
}

/// Failures of the command queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Terminal not found: {0}")]
    NotFound(String),
    #[error("Failed to write to terminal {terminal_id}: {reason}")]
    Write { terminal_id: String, reason: String },
}

impl QueueError {
    pub(crate) fn from_registry(terminal_id: &str, err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => QueueError::NotFound(id),
            other => QueueError::Write {
                terminal_id: terminal_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Shared output buffer is not available on this platform")]
    BufferUnavailable,
    #[error(transparent)]
    WorkerSpawn(WorkerError),
    #[error("Analysis worker is gone: {0}")]
    WorkerGone(String),
    #[error("Analysis service is not initialized")]
    NotInitialized,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl AnalysisError {
    /// Whether a later `initialize` could plausibly succeed. The service
    /// accepts a retry either way.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AnalysisError::BufferUnavailable)
    }
}

impl From<WorkerError> for AnalysisError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Spawn(_) => AnalysisError::WorkerSpawn(err),
            WorkerError::Disconnected(kind) => AnalysisError::WorkerGone(kind.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwitchError {
    #[error("A project switch is already in progress ({0})")]
    AlreadyInProgress(SwitchPhase),
    #[error("Previous switch failed; call reset() before switching again")]
    NeedsReset,
    #[error("Cannot reset while a switch is running ({0})")]
    NotResettable(SwitchPhase),
    #[error("Project switch failed during {phase}: {reason}")]
    Phase { phase: SwitchPhase, reason: String },
}

impl SwitchError {
    pub fn phase(&self) -> Option<SwitchPhase> {
        match self {
            SwitchError::AlreadyInProgress(phase) | SwitchError::NotResettable(phase) => {
                Some(*phase)
            }
            SwitchError::Phase { phase, .. } => Some(*phase),
            SwitchError::NeedsReset => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_is_retryable_through_registry() {
        let err = RegistryError::from(BridgeError::new("kill", "no such process"));
        assert!(err.is_retryable());
        assert_eq!(err.operation(), "kill");
        assert!(err.to_string().contains("no such process"));
    }

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = RegistryError::NotFound("t1".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Terminal not found: t1");
    }

    #[test]
    fn test_queue_error_maps_not_found() {
        let err = QueueError::from_registry("t1", RegistryError::NotFound("t1".to_string()));
        assert_eq!(err, QueueError::NotFound("t1".to_string()));

        let err = QueueError::from_registry(
            "t1",
            RegistryError::Bridge(BridgeError::new("write", "closed")),
        );
        assert!(matches!(err, QueueError::Write { .. }));
    }

    #[test]
    fn test_worker_errors_convert() {
        let err = AnalysisError::from(WorkerError::Disconnected("PING"));
        assert_eq!(err, AnalysisError::WorkerGone("PING".to_string()));
        assert!(err.is_retryable());
        assert!(!AnalysisError::BufferUnavailable.is_retryable());
    }

    #[test]
    fn test_switch_error_reports_phase() {
        let err = SwitchError::Phase {
            phase: SwitchPhase::HydrateNewState,
            reason: "store offline".to_string(),
        };
        assert_eq!(err.phase(), Some(SwitchPhase::HydrateNewState));
        assert!(err.to_string().contains("HYDRATE_NEW_STATE"));
    }
}
