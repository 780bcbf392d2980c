use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use canopy_common::mutex_lock_or_recover;
use canopy_core::SharedRingBuffer;

use crate::error::BridgeError;
use crate::ports::SharedBufferSource;
use crate::ports::SpawnRequest;
use crate::ports::SpawnedProcess;
use crate::ports::TerminalBridge;

#[derive(Default)]
struct BridgeLog {
    spawned: Vec<SpawnRequest>,
    killed: Vec<String>,
    writes: Vec<(String, Vec<u8>)>,
    resizes: Vec<(String, u16, u16)>,
    trashed: Vec<String>,
    restored: Vec<String>,
    buffering: Vec<(String, bool)>,
    flushed: Vec<String>,
    replayed: Vec<(String, usize)>,
    reconnected: Vec<String>,
    active_projects: Vec<String>,
}

/// Records every bridge call. Individual operations can be made to fail.
#[derive(Default)]
pub struct MockTerminalBridge {
    log: Mutex<BridgeLog>,
    spawn_error: Mutex<Option<String>>,
    failing: Mutex<HashSet<&'static str>>,
    live: Mutex<HashMap<String, Vec<String>>>,
    next_pid: AtomicU32,
}

impl MockTerminalBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawn(&self, reason: impl Into<String>) {
        *mutex_lock_or_recover(&self.spawn_error) = Some(reason.into());
    }

    /// Make `operation` (e.g. `"kill"`, `"write"`) fail until cleared.
    pub fn fail_operation(&self, operation: &'static str) {
        mutex_lock_or_recover(&self.failing).insert(operation);
    }

    pub fn clear_failures(&self) {
        *mutex_lock_or_recover(&self.spawn_error) = None;
        mutex_lock_or_recover(&self.failing).clear();
    }

    /// Processes `get_for_project` reports as still running.
    pub fn set_live(&self, project_id: &str, ids: &[&str]) {
        mutex_lock_or_recover(&self.live).insert(
            project_id.to_string(),
            ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    fn check(&self, operation: &'static str) -> Result<(), BridgeError> {
        if mutex_lock_or_recover(&self.failing).contains(operation) {
            return Err(BridgeError::new(operation, "injected failure"));
        }
        Ok(())
    }

    fn record<F>(&self, operation: &'static str, f: F) -> Result<(), BridgeError>
    where
        F: FnOnce(&mut BridgeLog),
    {
        self.check(operation)?;
        f(&mut mutex_lock_or_recover(&self.log));
        Ok(())
    }

    pub fn spawn_count(&self) -> usize {
        mutex_lock_or_recover(&self.log).spawned.len()
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        mutex_lock_or_recover(&self.log).spawned.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        mutex_lock_or_recover(&self.log).killed.clone()
    }

    /// Writes as lossy UTF-8, in call order.
    pub fn writes(&self) -> Vec<(String, String)> {
        mutex_lock_or_recover(&self.log)
            .writes
            .iter()
            .map(|(id, data)| (id.clone(), String::from_utf8_lossy(data).into_owned()))
            .collect()
    }

    pub fn written_to(&self, id: &str) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter(|(target, _)| target == id)
            .map(|(_, data)| data)
            .collect()
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        mutex_lock_or_recover(&self.log).resizes.clone()
    }

    pub fn trashed(&self) -> Vec<String> {
        mutex_lock_or_recover(&self.log).trashed.clone()
    }

    pub fn restored(&self) -> Vec<String> {
        mutex_lock_or_recover(&self.log).restored.clone()
    }

    pub fn buffering(&self) -> Vec<(String, bool)> {
        mutex_lock_or_recover(&self.log).buffering.clone()
    }

    pub fn flushed(&self) -> Vec<String> {
        mutex_lock_or_recover(&self.log).flushed.clone()
    }

    pub fn replayed(&self) -> Vec<(String, usize)> {
        mutex_lock_or_recover(&self.log).replayed.clone()
    }

    pub fn reconnected(&self) -> Vec<String> {
        mutex_lock_or_recover(&self.log).reconnected.clone()
    }

    pub fn active_projects(&self) -> Vec<String> {
        mutex_lock_or_recover(&self.log).active_projects.clone()
    }
}

impl TerminalBridge for MockTerminalBridge {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BridgeError> {
        if let Some(reason) = mutex_lock_or_recover(&self.spawn_error).clone() {
            return Err(BridgeError::new("spawn", reason));
        }
        self.record("spawn", |log| log.spawned.push(request.clone()))?;
        Ok(SpawnedProcess {
            id: request.id.clone(),
            pid: Some(1000 + self.next_pid.fetch_add(1, Ordering::SeqCst)),
        })
    }

    fn kill(&self, id: &str) -> Result<(), BridgeError> {
        self.record("kill", |log| log.killed.push(id.to_string()))
    }

    fn write(&self, id: &str, data: &[u8]) -> Result<(), BridgeError> {
        self.record("write", |log| log.writes.push((id.to_string(), data.to_vec())))
    }

    fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), BridgeError> {
        self.record("resize", |log| log.resizes.push((id.to_string(), cols, rows)))
    }

    fn trash(&self, id: &str) -> Result<(), BridgeError> {
        self.record("trash", |log| log.trashed.push(id.to_string()))
    }

    fn restore(&self, id: &str) -> Result<(), BridgeError> {
        self.record("restore", |log| log.restored.push(id.to_string()))
    }

    fn set_buffering(&self, id: &str, enabled: bool) -> Result<(), BridgeError> {
        self.record("set_buffering", |log| {
            log.buffering.push((id.to_string(), enabled))
        })
    }

    fn flush(&self, id: &str) -> Result<(), BridgeError> {
        self.record("flush", |log| log.flushed.push(id.to_string()))
    }

    fn replay_history(&self, id: &str, max_lines: usize) -> Result<usize, BridgeError> {
        self.record("replay_history", |log| {
            log.replayed.push((id.to_string(), max_lines))
        })?;
        Ok(max_lines)
    }

    fn get_for_project(&self, project_id: &str) -> Result<Vec<String>, BridgeError> {
        self.check("get_for_project")?;
        Ok(mutex_lock_or_recover(&self.live)
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }

    fn reconnect(&self, id: &str) -> Result<(), BridgeError> {
        self.record("reconnect", |log| log.reconnected.push(id.to_string()))
    }

    fn set_active_project(&self, project_id: &str) -> Result<(), BridgeError> {
        self.record("set_active_project", |log| {
            log.active_projects.push(project_id.to_string())
        })
    }
}

enum BufferMode {
    Available(SharedRingBuffer),
    Unsupported,
    Failing,
}

/// Hands out a fixed ring buffer, or reports it unavailable.
pub struct StaticBufferSource {
    mode: Mutex<BufferMode>,
    acquisitions: AtomicUsize,
}

impl StaticBufferSource {
    pub fn available(capacity: usize) -> Self {
        Self::with_mode(BufferMode::Available(SharedRingBuffer::with_capacity(
            capacity,
        )))
    }

    pub fn unsupported() -> Self {
        Self::with_mode(BufferMode::Unsupported)
    }

    pub fn failing() -> Self {
        Self::with_mode(BufferMode::Failing)
    }

    fn with_mode(mode: BufferMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Switch to handing out a buffer of `capacity` from now on.
    pub fn make_available(&self, capacity: usize) {
        *mutex_lock_or_recover(&self.mode) =
            BufferMode::Available(SharedRingBuffer::with_capacity(capacity));
    }

    pub fn buffer(&self) -> Option<SharedRingBuffer> {
        match &*mutex_lock_or_recover(&self.mode) {
            BufferMode::Available(ring) => Some(ring.clone()),
            _ => None,
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl SharedBufferSource for StaticBufferSource {
    fn acquire_shared_buffer(&self) -> Result<Option<SharedRingBuffer>, BridgeError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        match &*mutex_lock_or_recover(&self.mode) {
            BufferMode::Available(ring) => Ok(Some(ring.clone())),
            BufferMode::Unsupported => Ok(None),
            BufferMode::Failing => Err(BridgeError::new(
                "acquire_shared_buffer",
                "injected failure",
            )),
        }
    }
}
