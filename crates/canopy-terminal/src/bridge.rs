//! [`TerminalBridge`] over real PTYs.
//!
//! Each session gets a named reader thread. Every chunk it reads goes into
//! the shared analysis ring and the session's history, then either to the
//! output sink or into the hold-back buffer when the terminal is hidden.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;

use canopy_common::mutex_lock_or_recover;
use canopy_common::rwlock_read_or_recover;
use canopy_common::rwlock_write_or_recover;
use canopy_core::RingBufferError;
use canopy_core::SharedRingBuffer;
use canopy_registry::BridgeError;
use canopy_registry::ports::SharedBufferSource;
use canopy_registry::ports::SpawnRequest;
use canopy_registry::ports::SpawnedProcess;
use canopy_registry::ports::TerminalBridge;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::unbounded;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::trace;
use tracing::warn;

use crate::output::HISTORY_LINES;
use crate::output::SessionOutput;
use crate::pty::PtyHandle;
use crate::pty::PtyReader;

const READ_CHUNK: usize = 8192;
const READ_POLL_MS: i32 = 50;

/// Receives output that should be shown now.
pub type OutputSink = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct PtySession {
    id: String,
    project_id: Option<String>,
    pid: Option<u32>,
    handle: Mutex<PtyHandle>,
    output: Mutex<SessionOutput>,
    trashed: AtomicBool,
    stop: AtomicBool,
}

impl PtySession {
    fn is_running(&self) -> bool {
        mutex_lock_or_recover(&self.handle).is_running()
    }
}

/// Shared by the bridge and every reader thread.
struct Outlets {
    /// The ring has a single producer; reader threads take turns.
    ring: Mutex<SharedRingBuffer>,
    sink: OutputSink,
    exits: Sender<String>,
}

impl Outlets {
    fn deliver(&self, session: &PtySession, data: &[u8]) {
        match mutex_lock_or_recover(&self.ring).write_frame(&session.id, data) {
            Ok(()) => {}
            Err(RingBufferError::Full { .. }) => {
                trace!(terminal_id = %session.id, "Analysis ring full; frame dropped");
            }
            Err(e) => debug!(terminal_id = %session.id, error = %e, "Frame not written"),
        }
        let immediate = mutex_lock_or_recover(&session.output).accept(data);
        if immediate {
            (self.sink)(&session.id, data);
        }
    }
}

pub struct PtyBridge {
    sessions: RwLock<HashMap<String, Arc<PtySession>>>,
    active_project: Mutex<Option<String>>,
    outlets: Arc<Outlets>,
    shared_ring: SharedRingBuffer,
    exits_rx: Receiver<String>,
}

fn not_found(operation: &'static str, id: &str) -> BridgeError {
    BridgeError::new(operation, format!("no terminal session {id}"))
}

impl PtyBridge {
    pub fn new(ring_capacity: usize, sink: OutputSink) -> Self {
        let ring = SharedRingBuffer::with_capacity(ring_capacity);
        let (exits, exits_rx) = unbounded();
        Self {
            sessions: RwLock::new(HashMap::new()),
            active_project: Mutex::new(None),
            outlets: Arc::new(Outlets {
                ring: Mutex::new(ring.clone()),
                sink,
                exits,
            }),
            shared_ring: ring,
            exits_rx,
        }
    }

    /// Ids of sessions whose reader saw the process exit.
    pub fn exits(&self) -> Receiver<String> {
        self.exits_rx.clone()
    }

    pub fn session_count(&self) -> usize {
        rwlock_read_or_recover(&self.sessions).len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.session(id).is_some_and(|s| s.is_running())
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.session(id).and_then(|s| s.pid)
    }

    pub fn is_trashed(&self, id: &str) -> bool {
        self.session(id)
            .is_some_and(|s| s.trashed.load(Ordering::Acquire))
    }

    fn session(&self, id: &str) -> Option<Arc<PtySession>> {
        rwlock_read_or_recover(&self.sessions).get(id).cloned()
    }

    fn require(&self, operation: &'static str, id: &str) -> Result<Arc<PtySession>, BridgeError> {
        self.session(id).ok_or_else(|| not_found(operation, id))
    }

    /// Kill every session. Used on shutdown.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<PtySession>> = rwlock_write_or_recover(&self.sessions)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.stop.store(true, Ordering::Release);
            if let Err(e) = mutex_lock_or_recover(&session.handle).kill() {
                warn!(terminal_id = %session.id, error = %e, "Failed to kill terminal on shutdown");
            }
        }
    }

    fn start_reader(&self, session: Arc<PtySession>, reader: PtyReader) -> std::io::Result<()> {
        let outlets = Arc::clone(&self.outlets);
        thread::Builder::new()
            .name(format!("pty-reader-{}", session.id))
            .spawn(move || read_loop(session, reader, outlets))
            .map(|_| ())
    }
}

/// Stop a session that never made it into the table.
fn discard(session: &PtySession) {
    session.stop.store(true, Ordering::Release);
    if let Err(e) = mutex_lock_or_recover(&session.handle).kill() {
        warn!(terminal_id = %session.id, error = %e, "Failed to kill discarded terminal process");
    }
}

fn read_loop(session: Arc<PtySession>, reader: PtyReader, outlets: Arc<Outlets>) {
    let span = info_span!("pty_reader", terminal_id = %session.id);
    let _enter = span.enter();
    let mut buf = [0u8; READ_CHUNK];

    while !session.stop.load(Ordering::Acquire) {
        match reader.try_read(&mut buf, READ_POLL_MS) {
            Ok(0) => {
                if !session.is_running() {
                    break;
                }
            }
            Ok(n) => outlets.deliver(&session, &buf[..n]),
            Err(e) => {
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }

    debug!("PTY reader exiting");
    let _ = outlets.exits.send(session.id.clone());
}

impl TerminalBridge for PtyBridge {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BridgeError> {
        if self.session(&request.id).is_some() {
            return Err(BridgeError::new(
                "spawn",
                format!("terminal session {} already exists", request.id),
            ));
        }

        let mut env = request.env.clone();
        env.push(("CANOPY_TERMINAL_ID".to_string(), request.id.clone()));
        let handle = PtyHandle::spawn(
            request.command.as_deref(),
            request.cwd.as_deref(),
            &env,
            request.cols,
            request.rows,
        )
        .map_err(|e| {
            warn!(terminal_id = %request.id, error = %e, hint = e.suggestion(), "PTY spawn failed");
            BridgeError::from(e)
        })?;

        let pid = handle.pid();
        let reader = handle.reader();
        let session = Arc::new(PtySession {
            id: request.id.clone(),
            project_id: mutex_lock_or_recover(&self.active_project).clone(),
            pid,
            handle: Mutex::new(handle),
            output: Mutex::new(SessionOutput::new(HISTORY_LINES)),
            trashed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        {
            let mut sessions = rwlock_write_or_recover(&self.sessions);
            if sessions.contains_key(&request.id) {
                drop(sessions);
                discard(&session);
                return Err(BridgeError::new(
                    "spawn",
                    format!("terminal session {} already exists", request.id),
                ));
            }
            sessions.insert(request.id.clone(), Arc::clone(&session));
        }
        if let Err(e) = self.start_reader(Arc::clone(&session), reader) {
            rwlock_write_or_recover(&self.sessions).remove(&request.id);
            discard(&session);
            return Err(BridgeError::new("spawn", format!("reader thread: {e}")));
        }

        info!(terminal_id = %request.id, pid = ?pid, kind = ?request.kind, "Terminal process started");
        Ok(SpawnedProcess {
            id: request.id.clone(),
            pid,
        })
    }

    fn kill(&self, id: &str) -> Result<(), BridgeError> {
        let session = rwlock_write_or_recover(&self.sessions)
            .remove(id)
            .ok_or_else(|| not_found("kill", id))?;
        session.stop.store(true, Ordering::Release);
        mutex_lock_or_recover(&session.handle).kill()?;
        debug!(terminal_id = %id, "Terminal process killed");
        Ok(())
    }

    fn write(&self, id: &str, data: &[u8]) -> Result<(), BridgeError> {
        let session = self.require("write", id)?;
        let handle = mutex_lock_or_recover(&session.handle);
        Ok(handle.write(data)?)
    }

    fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), BridgeError> {
        let session = self.require("resize", id)?;
        let mut handle = mutex_lock_or_recover(&session.handle);
        Ok(handle.resize(cols, rows)?)
    }

    /// The process keeps running; only the flag changes.
    fn trash(&self, id: &str) -> Result<(), BridgeError> {
        self.require("trash", id)?
            .trashed
            .store(true, Ordering::Release);
        Ok(())
    }

    fn restore(&self, id: &str) -> Result<(), BridgeError> {
        self.require("restore", id)?
            .trashed
            .store(false, Ordering::Release);
        Ok(())
    }

    fn set_buffering(&self, id: &str, enabled: bool) -> Result<(), BridgeError> {
        let session = self.require("set_buffering", id)?;
        mutex_lock_or_recover(&session.output).set_buffering(enabled);
        Ok(())
    }

    fn flush(&self, id: &str) -> Result<(), BridgeError> {
        let session = self.require("flush", id)?;
        let pending = mutex_lock_or_recover(&session.output).take_pending();
        if !pending.is_empty() {
            debug!(terminal_id = %id, bytes = pending.len(), "Flushing held output");
            (self.outlets.sink)(id, &pending);
        }
        Ok(())
    }

    fn replay_history(&self, id: &str, max_lines: usize) -> Result<usize, BridgeError> {
        let session = self.require("replay_history", id)?;
        let (bytes, lines) = mutex_lock_or_recover(&session.output)
            .history()
            .tail(max_lines);
        if !bytes.is_empty() {
            (self.outlets.sink)(id, &bytes);
        }
        Ok(lines)
    }

    fn get_for_project(&self, project_id: &str) -> Result<Vec<String>, BridgeError> {
        let sessions: Vec<Arc<PtySession>> = rwlock_read_or_recover(&self.sessions)
            .values()
            .filter(|s| s.project_id.as_deref() == Some(project_id))
            .cloned()
            .collect();
        let mut ids: Vec<String> = sessions
            .into_iter()
            .filter(|s| s.is_running())
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn reconnect(&self, id: &str) -> Result<(), BridgeError> {
        let session = self.require("reconnect", id)?;
        if !session.is_running() {
            return Err(BridgeError::new("reconnect", format!("terminal {id} has exited")));
        }
        debug!(terminal_id = %id, "Terminal reconnected");
        Ok(())
    }

    fn set_active_project(&self, project_id: &str) -> Result<(), BridgeError> {
        *mutex_lock_or_recover(&self.active_project) = Some(project_id.to_string());
        info!(project_id, "Active project changed");
        Ok(())
    }
}

impl SharedBufferSource for PtyBridge {
    fn acquire_shared_buffer(&self) -> Result<Option<SharedRingBuffer>, BridgeError> {
        Ok(Some(self.shared_ring.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_registry::PanelKind;
    use std::time::Duration;
    use std::time::Instant;

    type Captured = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    fn bridge() -> (PtyBridge, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let bridge = PtyBridge::new(
            64 * 1024,
            Arc::new(move |id: &str, data: &[u8]| {
                sink.lock().unwrap().push((id.to_string(), data.to_vec()));
            }),
        );
        (bridge, captured)
    }

    fn request(id: &str, command: &str) -> SpawnRequest {
        SpawnRequest {
            id: id.to_string(),
            kind: PanelKind::Terminal,
            command: Some(command.to_string()),
            cwd: None,
            cols: 80,
            rows: 24,
            env: Vec::new(),
        }
    }

    fn shown(captured: &Captured, id: &str) -> String {
        let bytes: Vec<u8> = captured
            .lock()
            .unwrap()
            .iter()
            .filter(|(cid, _)| cid == id)
            .flat_map(|(_, data)| data.clone())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn wait_for_exit(bridge: &PtyBridge, id: &str) {
        let exits = bridge.exits();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(exited) = exits.recv_timeout(Duration::from_millis(100)) {
                if exited == id {
                    return;
                }
            }
        }
        panic!("terminal {id} did not exit");
    }

    /// Spawn or skip when the environment has no PTYs.
    fn spawn_or_skip(bridge: &PtyBridge, req: &SpawnRequest) -> bool {
        match bridge.spawn(req) {
            Ok(_) => true,
            Err(e) if e.operation() == "open" => {
                eprintln!("skipping: no PTY available ({e})");
                false
            }
            Err(e) => panic!("spawn failed: {e}"),
        }
    }

    #[test]
    fn test_unknown_session_errors_name_the_operation() {
        let (bridge, _) = bridge();
        assert_eq!(bridge.write("nope", b"x").unwrap_err().operation(), "write");
        assert_eq!(bridge.flush("nope").unwrap_err().operation(), "flush");
        assert_eq!(bridge.kill("nope").unwrap_err().operation(), "kill");
        assert_eq!(bridge.get_for_project("p").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_shared_buffer_is_one_ring() {
        let (bridge, _) = bridge();
        let a = bridge.acquire_shared_buffer().unwrap().unwrap();
        let b = bridge.acquire_shared_buffer().unwrap().unwrap();
        assert!(a.same_ring(&b));
        assert_eq!(a.capacity(), 64 * 1024);
    }

    #[test]
    fn test_visible_output_reaches_sink_and_ring() {
        let (bridge, captured) = bridge();
        if !spawn_or_skip(&bridge, &request("t1", "echo visible-line")) {
            return;
        }
        wait_for_exit(&bridge, "t1");

        assert!(shown(&captured, "t1").contains("visible-line"));
        let ring = bridge.acquire_shared_buffer().unwrap().unwrap();
        let mut analysed = Vec::new();
        while let Some(frame) = ring.read_frame() {
            assert_eq!(frame.terminal_id, "t1");
            analysed.extend(frame.data);
        }
        assert!(String::from_utf8_lossy(&analysed).contains("visible-line"));
    }

    #[test]
    fn test_buffered_output_waits_for_flush_and_history_replays() {
        let (bridge, captured) = bridge();
        if !spawn_or_skip(&bridge, &request("t1", "sleep 0.3; echo held-line")) {
            return;
        }
        bridge.set_buffering("t1", true).unwrap();
        wait_for_exit(&bridge, "t1");
        assert!(!shown(&captured, "t1").contains("held-line"));

        bridge.set_buffering("t1", false).unwrap();
        bridge.flush("t1").unwrap();
        assert!(shown(&captured, "t1").contains("held-line"));

        captured.lock().unwrap().clear();
        let lines = bridge.replay_history("t1", 10).unwrap();
        assert!(lines >= 1);
        assert!(shown(&captured, "t1").contains("held-line"));
    }

    #[test]
    fn test_sessions_are_tagged_with_active_project() {
        let (bridge, _) = bridge();
        bridge.set_active_project("proj-a").unwrap();
        if !spawn_or_skip(&bridge, &request("t1", "sleep 5")) {
            return;
        }
        bridge.set_active_project("proj-b").unwrap();

        assert_eq!(bridge.get_for_project("proj-a").unwrap(), vec!["t1"]);
        assert!(bridge.get_for_project("proj-b").unwrap().is_empty());
        bridge.reconnect("t1").unwrap();

        bridge.trash("t1").unwrap();
        assert!(bridge.is_trashed("t1"));
        assert!(bridge.is_running("t1"));
        bridge.restore("t1").unwrap();
        assert!(!bridge.is_trashed("t1"));

        bridge.kill("t1").unwrap();
        assert_eq!(bridge.session_count(), 0);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let (bridge, _) = bridge();
        if !spawn_or_skip(&bridge, &request("t1", "sleep 5")) {
            return;
        }
        let err = bridge.spawn(&request("t1", "true")).unwrap_err();
        assert_eq!(err.operation(), "spawn");
        bridge.shutdown();
        assert_eq!(bridge.session_count(), 0);
    }
}
