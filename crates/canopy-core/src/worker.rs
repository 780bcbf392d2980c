//! The analysis worker: a dedicated thread that polls the shared ring buffer,
//! runs pattern detection per terminal and reports back over a channel.
//!
//! The host only sees the worker through [`WorkerFactory`] and
//! [`WorkerHandle`], so tests can swap the thread for a scripted fake.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;
use tracing::debug;
use tracing::error;
use tracing::info_span;
use tracing::trace;
use tracing::warn;

use crate::artifacts::ArtifactExtractor;
use crate::artifacts::DEFAULT_DEDUP_WINDOW;
use crate::detector::AgentStateDetector;
use crate::detector::DEFAULT_QUIET_IDLE;
use crate::detector::Detection;
use crate::error::WorkerError;
use crate::patterns::strip_ansi_codes;
use crate::protocol::AgentState;
use crate::protocol::Artifact;
use crate::protocol::ArtifactBatch;
use crate::protocol::StateChange;
use crate::protocol::TerminalRegistration;
use crate::protocol::TerminalUpdate;
use crate::protocol::WorkerEnvelope;
use crate::protocol::WorkerEvent;
use crate::protocol::WorkerFailure;
use crate::protocol::WorkerRequest;
use crate::ring_buffer::SharedRingBuffer;

/// Idle poll cadence of the worker loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on frames consumed before the worker looks at its request
/// channel again.
const MAX_FRAMES_PER_PASS: usize = 256;

/// Longest unterminated line kept between chunks.
const MAX_PARTIAL_LINE: usize = 4096;

/// Host-side handle to a running worker.
pub trait WorkerHandle: Send {
    fn post(&self, request: WorkerRequest) -> Result<(), WorkerError>;

    /// Stop the worker. Messages it sends afterwards are stale.
    fn terminate(self: Box<Self>);
}

/// Builds workers. `generation` is stamped on every envelope the new worker
/// sends so the host can drop output from workers it already replaced.
pub trait WorkerFactory: Send + Sync {
    fn spawn(
        &self,
        generation: u64,
        outputs: Sender<WorkerEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>, WorkerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub quiet_idle: Duration,
    pub dedup_window: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            quiet_idle: DEFAULT_QUIET_IDLE,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// Runs each worker on its own named OS thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadWorkerFactory {
    settings: WorkerSettings,
}

impl ThreadWorkerFactory {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn spawn(
        &self,
        generation: u64,
        outputs: Sender<WorkerEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = AnalysisWorker::new(
            generation,
            request_rx,
            outputs.clone(),
            Arc::clone(&shutdown),
            self.settings,
        );

        let thread = thread::Builder::new()
            .name(format!("analysis-worker-{generation}"))
            .spawn(move || {
                let span = info_span!("analysis_worker", generation);
                let _enter = span.enter();
                run_guarded(generation, &outputs, move || worker.run());
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        Ok(Box::new(ThreadWorkerHandle {
            requests: request_tx,
            shutdown,
            thread: Some(thread),
        }))
    }
}

struct ThreadWorkerHandle {
    requests: Sender<WorkerRequest>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle for ThreadWorkerHandle {
    fn post(&self, request: WorkerRequest) -> Result<(), WorkerError> {
        let kind = request.kind();
        self.requests
            .send(request)
            .map_err(|_| WorkerError::Disconnected(kind))
    }

    fn terminate(mut self: Box<Self>) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            drop(self);
            if thread.join().is_err() {
                debug!("Analysis worker thread had already panicked");
            }
        }
    }
}

impl Drop for ThreadWorkerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Run a worker body, turning a panic into a `Crashed` envelope.
pub fn run_guarded<F>(generation: u64, outputs: &Sender<WorkerEnvelope>, body: F)
where
    F: FnOnce(),
{
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(body)) {
        let reason = panic_message(payload.as_ref());
        error!(generation, reason = %reason, "Analysis worker crashed");
        if outputs
            .send(WorkerEnvelope::crashed(generation, reason))
            .is_err()
        {
            debug!(generation, "Host gone before crash could be reported");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "analysis worker panicked".to_string()
    }
}

/// The host dropped its receiver; the worker has nobody left to talk to.
struct HostGone;

struct TerminalAnalysis {
    registration: TerminalRegistration,
    carry: Vec<u8>,
    partial: String,
    detector: AgentStateDetector,
    extractor: ArtifactExtractor,
}

impl TerminalAnalysis {
    fn new(registration: TerminalRegistration, settings: &WorkerSettings) -> Self {
        let initial = registration.initial_state.unwrap_or(AgentState::Idle);
        Self {
            registration,
            carry: Vec::new(),
            partial: String::new(),
            detector: AgentStateDetector::new(initial, settings.quiet_idle),
            extractor: ArtifactExtractor::new(settings.dedup_window),
        }
    }

    /// Decode as much of the carried bytes as forms complete UTF-8.
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let split = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.carry.len(),
        };
        let rest = self.carry.split_off(split);
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry = rest;
        text
    }

    fn ingest(&mut self, bytes: &[u8], now: Instant) -> (Option<Detection>, Vec<Artifact>) {
        let text = strip_ansi_codes(&self.decode(bytes));
        let mut buffered = std::mem::take(&mut self.partial);
        buffered.push_str(&text);

        let mut segments: Vec<&str> = buffered.split(['\n', '\r']).collect();
        let tail = segments.pop().unwrap_or_default();

        let artifacts = self.extractor.extract(&segments);
        if !tail.trim().is_empty() {
            segments.push(tail);
        }
        let detection = self.detector.observe(&segments, now);

        self.partial = if tail.len() > MAX_PARTIAL_LINE {
            let mut cut = tail.len() - MAX_PARTIAL_LINE;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail[cut..].to_string()
        } else {
            tail.to_string()
        };

        (detection, artifacts)
    }

    fn state_change(&self, detection: Detection) -> Option<StateChange> {
        let agent_id = self.registration.agent_id.clone()?;
        Some(StateChange {
            terminal_id: self.registration.terminal_id.clone(),
            agent_id,
            state: detection.state,
            previous_state: detection.previous,
            timestamp: chrono::Utc::now().timestamp_millis(),
            trigger: detection.trigger,
            confidence: detection.confidence,
            worktree_id: self.registration.worktree_id.clone(),
            trace_id: self.registration.trace_id.clone(),
        })
    }
}

struct AnalysisWorker {
    generation: u64,
    requests: Receiver<WorkerRequest>,
    outputs: Sender<WorkerEnvelope>,
    shutdown: Arc<AtomicBool>,
    settings: WorkerSettings,
    ring: Option<SharedRingBuffer>,
    reported_drops: u64,
    terminals: HashMap<String, TerminalAnalysis>,
}

impl AnalysisWorker {
    fn new(
        generation: u64,
        requests: Receiver<WorkerRequest>,
        outputs: Sender<WorkerEnvelope>,
        shutdown: Arc<AtomicBool>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            generation,
            requests,
            outputs,
            shutdown,
            settings,
            ring: None,
            reported_drops: 0,
            terminals: HashMap::new(),
        }
    }

    fn run(mut self) {
        debug!("Analysis worker started");
        while self.pass().is_ok() {}
        debug!(terminals = self.terminals.len(), "Analysis worker stopped");
    }

    /// One poll iteration: requests first, then buffered output, then the
    /// quiet-period clock. Sleeps on the request channel only when there was
    /// nothing to do.
    fn pass(&mut self) -> Result<(), HostGone> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(HostGone);
        }

        let mut busy = false;
        loop {
            match self.requests.try_recv() {
                Ok(request) => {
                    busy = true;
                    self.handle(request)?;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(HostGone),
            }
        }

        let now = Instant::now();
        busy |= self.drain_ring(now)?;
        self.tick(now)?;

        if !busy {
            match self.requests.recv_timeout(self.settings.poll_interval) {
                Ok(request) => self.handle(request)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(HostGone),
            }
        }
        Ok(())
    }

    fn emit(&self, event: WorkerEvent) -> Result<(), HostGone> {
        self.outputs
            .send(WorkerEnvelope::event(self.generation, event))
            .map_err(|_| HostGone)
    }

    fn handle(&mut self, request: WorkerRequest) -> Result<(), HostGone> {
        trace!(kind = request.kind(), "Worker request");
        match request {
            WorkerRequest::InitBuffer(ring) => {
                self.reported_drops = ring.dropped_frames();
                self.ring = Some(ring);
                self.emit(WorkerEvent::Ready)
            }
            WorkerRequest::RegisterTerminal(registration) => self.register(registration),
            WorkerRequest::UpdateTerminal(update) => {
                self.update(update);
                Ok(())
            }
            WorkerRequest::UnregisterTerminal { terminal_id } => {
                self.terminals.remove(&terminal_id);
                Ok(())
            }
            WorkerRequest::Reset => {
                self.terminals.clear();
                if let Some(ring) = &self.ring {
                    ring.clear();
                }
                Ok(())
            }
            WorkerRequest::Ping => self.emit(WorkerEvent::Pong),
        }
    }

    fn register(&mut self, registration: TerminalRegistration) -> Result<(), HostGone> {
        let terminal_id = registration.terminal_id.clone();
        if !self.terminals.contains_key(&terminal_id) {
            let analysis = TerminalAnalysis::new(registration, &self.settings);
            self.terminals.insert(terminal_id, analysis);
            return Ok(());
        }
        let Some(existing) = self.terminals.get_mut(&terminal_id) else {
            return Ok(());
        };

        let target = registration.initial_state.unwrap_or(AgentState::Idle);
        existing.registration = registration;
        existing.carry.clear();
        existing.partial.clear();
        existing.extractor.clear();
        let change = existing
            .detector
            .respawn(target)
            .and_then(|detection| existing.state_change(detection));
        match change {
            Some(change) => self.emit(WorkerEvent::StateChanged(change)),
            None => Ok(()),
        }
    }

    fn update(&mut self, update: TerminalUpdate) {
        let Some(analysis) = self.terminals.get_mut(&update.terminal_id) else {
            debug!(terminal_id = %update.terminal_id, "Update for unregistered terminal");
            return;
        };
        let registration = &mut analysis.registration;
        if update.agent_id.is_some() {
            registration.agent_id = update.agent_id;
        }
        if let Some(worktree_id) = update.worktree_id {
            registration.worktree_id = worktree_id;
        }
        if update.trace_id.is_some() {
            registration.trace_id = update.trace_id;
        }
    }

    fn drain_ring(&mut self, now: Instant) -> Result<bool, HostGone> {
        let Some(ring) = self.ring.clone() else {
            return Ok(false);
        };

        let mut consumed = 0;
        while consumed < MAX_FRAMES_PER_PASS {
            let Some(frame) = ring.read_frame() else {
                break;
            };
            consumed += 1;

            let Some(analysis) = self.terminals.get_mut(&frame.terminal_id) else {
                continue;
            };
            let (detection, artifacts) = analysis.ingest(&frame.data, now);
            let change = detection.and_then(|d| analysis.state_change(d));

            if !artifacts.is_empty() {
                self.emit(WorkerEvent::ArtifactDetected(ArtifactBatch {
                    terminal_id: frame.terminal_id.clone(),
                    artifacts,
                }))?;
            }
            if let Some(change) = change {
                self.emit(WorkerEvent::StateChanged(change))?;
            }
        }

        let dropped = ring.dropped_frames();
        if dropped > self.reported_drops {
            let lost = dropped - self.reported_drops;
            self.reported_drops = dropped;
            warn!(lost, "Ring buffer overflowed; output frames were dropped");
            self.emit(WorkerEvent::Error(WorkerFailure {
                error: format!("{lost} output frames dropped"),
                context: Some("ring_buffer".to_string()),
            }))?;
        }

        Ok(consumed > 0)
    }

    fn tick(&mut self, now: Instant) -> Result<(), HostGone> {
        let changes: Vec<StateChange> = self
            .terminals
            .values_mut()
            .filter_map(|analysis| {
                let detection = analysis.detector.tick(now)?;
                analysis.state_change(detection)
            })
            .collect();
        for change in changes {
            self.emit(WorkerEvent::StateChanged(change))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StateTrigger;
    use crate::protocol::WorkerOutput;

    const WAIT: Duration = Duration::from_secs(5);

    fn start(
        settings: WorkerSettings,
    ) -> (Box<dyn WorkerHandle>, Receiver<WorkerEnvelope>, SharedRingBuffer) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = ThreadWorkerFactory::new(settings).spawn(7, tx).unwrap();
        let ring = SharedRingBuffer::with_capacity(4096);
        worker.post(WorkerRequest::InitBuffer(ring.clone())).unwrap();
        (worker, rx, ring)
    }

    fn next_event(rx: &Receiver<WorkerEnvelope>) -> WorkerEvent {
        let envelope = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(envelope.generation, 7);
        match envelope.output {
            WorkerOutput::Event(event) => event,
            WorkerOutput::Crashed(reason) => panic!("worker crashed: {reason}"),
        }
    }

    fn next_state_change(rx: &Receiver<WorkerEnvelope>) -> StateChange {
        loop {
            if let WorkerEvent::StateChanged(change) = next_event(rx) {
                return change;
            }
        }
    }

    #[test]
    fn test_ready_after_init_buffer_and_pong_after_ping() {
        let (worker, rx, _ring) = start(WorkerSettings::default());
        assert_eq!(next_event(&rx), WorkerEvent::Ready);

        worker.post(WorkerRequest::Ping).unwrap();
        assert_eq!(next_event(&rx), WorkerEvent::Pong);
        worker.terminate();
    }

    #[test]
    fn test_agent_output_produces_state_change_with_metadata() {
        let (worker, rx, ring) = start(WorkerSettings::default());
        assert_eq!(next_event(&rx), WorkerEvent::Ready);

        worker
            .post(WorkerRequest::RegisterTerminal(
                TerminalRegistration::new("t1")
                    .with_agent("claude")
                    .with_worktree(Some("wt-a".to_string()))
                    .with_trace("trace-1"),
            ))
            .unwrap();
        worker.post(WorkerRequest::Ping).unwrap();
        assert_eq!(next_event(&rx), WorkerEvent::Pong);

        ring.write_frame("t1", "\x1b[33m⠋ Thinking\x1b[0m\r\n".as_bytes())
            .unwrap();
        let change = next_state_change(&rx);
        assert_eq!(change.terminal_id, "t1");
        assert_eq!(change.agent_id, "claude");
        assert_eq!(change.state, AgentState::Working);
        assert_eq!(change.previous_state, AgentState::Idle);
        assert_eq!(change.trigger, StateTrigger::Busy);
        assert_eq!(change.worktree_id.as_deref(), Some("wt-a"));
        assert_eq!(change.trace_id.as_deref(), Some("trace-1"));

        // Prompt without a trailing newline is still seen.
        ring.write_frame("t1", b"Proceed? (y/n) ").unwrap();
        let change = next_state_change(&rx);
        assert_eq!(change.state, AgentState::Waiting);
        worker.terminate();
    }

    #[test]
    fn test_update_can_clear_the_worktree() {
        let (worker, rx, ring) = start(WorkerSettings::default());
        assert_eq!(next_event(&rx), WorkerEvent::Ready);
        worker
            .post(WorkerRequest::RegisterTerminal(
                TerminalRegistration::new("t1")
                    .with_agent("claude")
                    .with_worktree(Some("wt-a".to_string())),
            ))
            .unwrap();
        worker
            .post(WorkerRequest::UpdateTerminal(TerminalUpdate {
                terminal_id: "t1".to_string(),
                worktree_id: Some(None),
                ..TerminalUpdate::default()
            }))
            .unwrap();
        worker.post(WorkerRequest::Ping).unwrap();
        assert_eq!(next_event(&rx), WorkerEvent::Pong);

        ring.write_frame("t1", "\x1b[33m⠋ Thinking\x1b[0m\r\n".as_bytes())
            .unwrap();
        let change = next_state_change(&rx);
        assert_eq!(change.agent_id, "claude");
        assert_eq!(change.worktree_id, None);
        worker.terminate();
    }

    #[test]
    fn test_artifacts_are_reported_for_complete_lines() {
        let (worker, rx, ring) = start(WorkerSettings::default());
        assert_eq!(next_event(&rx), WorkerEvent::Ready);
        worker
            .post(WorkerRequest::RegisterTerminal(TerminalRegistration::new("t1")))
            .unwrap();
        worker.post(WorkerRequest::Ping).unwrap();
        assert_eq!(next_event(&rx), WorkerEvent::Pong);

        ring.write_frame("t1", b"Local: http://localhost:3000/\n").unwrap();
        let event = loop {
            let event = next_event(&rx);
            if matches!(event, WorkerEvent::ArtifactDetected(_)) {
                break event;
            }
        };
        let WorkerEvent::ArtifactDetected(batch) = event else {
            unreachable!();
        };
        assert_eq!(batch.terminal_id, "t1");
        assert_eq!(batch.artifacts[0].value, "http://localhost:3000/");
        worker.terminate();
    }

    #[test]
    fn test_terminal_without_agent_emits_no_state_changes() {
        let (worker, rx, ring) = start(WorkerSettings::default());
        assert_eq!(next_event(&rx), WorkerEvent::Ready);
        worker
            .post(WorkerRequest::RegisterTerminal(TerminalRegistration::new("plain")))
            .unwrap();
        worker.post(WorkerRequest::Ping).unwrap();
        assert_eq!(next_event(&rx), WorkerEvent::Pong);

        ring.write_frame("plain", "⠋ Thinking\n".as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(50));
        worker.post(WorkerRequest::Ping).unwrap();
        let mut events = Vec::new();
        loop {
            let event = next_event(&rx);
            if event == WorkerEvent::Pong {
                break;
            }
            events.push(event);
        }
        assert!(events
            .iter()
            .all(|e| !matches!(e, WorkerEvent::StateChanged(_))));
        worker.terminate();
    }

    #[test]
    fn test_quiet_fallback_reports_idle() {
        let settings = WorkerSettings {
            quiet_idle: Duration::from_millis(50),
            ..WorkerSettings::default()
        };
        let (worker, rx, ring) = start(settings);
        assert_eq!(next_event(&rx), WorkerEvent::Ready);
        worker
            .post(WorkerRequest::RegisterTerminal(
                TerminalRegistration::new("t1").with_agent("codex"),
            ))
            .unwrap();
        worker.post(WorkerRequest::Ping).unwrap();
        assert_eq!(next_event(&rx), WorkerEvent::Pong);

        ring.write_frame("t1", "⠋ Thinking\n".as_bytes()).unwrap();
        assert_eq!(next_state_change(&rx).state, AgentState::Working);
        let change = next_state_change(&rx);
        assert_eq!(change.state, AgentState::Idle);
        assert_eq!(change.trigger, StateTrigger::Quiet);
        worker.terminate();
    }

    #[test]
    fn test_reregister_respawns_failed_agent() {
        let (worker, rx, ring) = start(WorkerSettings::default());
        assert_eq!(next_event(&rx), WorkerEvent::Ready);
        let registration = TerminalRegistration::new("t1").with_agent("claude");
        worker
            .post(WorkerRequest::RegisterTerminal(registration.clone()))
            .unwrap();
        worker.post(WorkerRequest::Ping).unwrap();
        assert_eq!(next_event(&rx), WorkerEvent::Pong);

        ring.write_frame("t1", "⠋ Thinking\n".as_bytes()).unwrap();
        assert_eq!(next_state_change(&rx).state, AgentState::Working);
        ring.write_frame("t1", b"fatal: repository not found\n").unwrap();
        assert_eq!(next_state_change(&rx).state, AgentState::Failed);

        worker
            .post(WorkerRequest::RegisterTerminal(registration))
            .unwrap();
        let change = next_state_change(&rx);
        assert_eq!(change.state, AgentState::Idle);
        assert_eq!(change.previous_state, AgentState::Failed);
        assert_eq!(change.trigger, StateTrigger::Respawn);
        worker.terminate();
    }

    #[test]
    fn test_split_utf8_sequence_is_reassembled() {
        let mut analysis = TerminalAnalysis::new(
            TerminalRegistration::new("t1").with_agent("a"),
            &WorkerSettings::default(),
        );
        let bytes = "⠋ Thinking\n".as_bytes();
        let now = Instant::now();
        let (first, _) = analysis.ingest(&bytes[..1], now);
        assert!(first.is_none());
        let (second, _) = analysis.ingest(&bytes[1..], now);
        assert_eq!(second.map(|d| d.state), Some(AgentState::Working));
    }

    #[test]
    fn test_terminate_stops_the_thread() {
        let (worker, rx, _ring) = start(WorkerSettings::default());
        assert_eq!(next_event(&rx), WorkerEvent::Ready);
        worker.terminate();
        // The worker owned the only other sender clone besides the crash
        // reporter; once the thread exits the channel disconnects.
        assert!(rx.recv_timeout(WAIT).is_err());
    }

    #[test]
    fn test_panicking_body_is_reported_as_crash() {
        let (tx, rx) = crossbeam_channel::unbounded();
        run_guarded(3, &tx, || panic!("boom"));
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope, WorkerEnvelope::crashed(3, "boom"));
    }
}
