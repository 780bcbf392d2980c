//! Ports into the privileged process that owns the PTYs.

use canopy_core::SharedRingBuffer;

use crate::domain::PanelKind;
use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub id: String,
    pub kind: PanelKind,
    /// Shell command line; `None` starts the user's default shell.
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedProcess {
    pub id: String,
    pub pid: Option<u32>,
}

/// Terminal lifecycle calls. Ids are opaque strings chosen by the registry.
pub trait TerminalBridge: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BridgeError>;
    fn kill(&self, id: &str) -> Result<(), BridgeError>;
    fn write(&self, id: &str, data: &[u8]) -> Result<(), BridgeError>;
    fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), BridgeError>;
    fn trash(&self, id: &str) -> Result<(), BridgeError>;
    fn restore(&self, id: &str) -> Result<(), BridgeError>;
    /// Hidden terminals hold their output instead of streaming it.
    fn set_buffering(&self, id: &str, enabled: bool) -> Result<(), BridgeError>;
    fn flush(&self, id: &str) -> Result<(), BridgeError>;
    /// Re-emit up to `max_lines` of scrollback; returns the lines replayed.
    fn replay_history(&self, id: &str, max_lines: usize) -> Result<usize, BridgeError>;
    /// Ids of processes still alive for a project.
    fn get_for_project(&self, project_id: &str) -> Result<Vec<String>, BridgeError>;
    fn reconnect(&self, id: &str) -> Result<(), BridgeError>;
    fn set_active_project(&self, project_id: &str) -> Result<(), BridgeError>;
}

pub trait SharedBufferSource: Send + Sync {
    /// `Ok(None)` means shared memory is unsupported here.
    fn acquire_shared_buffer(&self) -> Result<Option<SharedRingBuffer>, BridgeError>;
}
