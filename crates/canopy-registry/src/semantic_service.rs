//! Host side of the analysis worker.
//!
//! The service owns the worker handle and a cache of terminal registrations.
//! Worker output arrives on a channel and is turned into [`AnalysisEvent`]s
//! by [`SemanticAnalysisService::pump`]. Every worker is stamped with a
//! generation; output from a replaced worker is discarded.
//!
//! A worker crash is retried once after [`CRASH_RETRY_DELAY`]. The new worker
//! gets the cached registrations once it reports `READY`.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use canopy_common::mutex_lock_or_recover;
use canopy_core::ArtifactBatch;
use canopy_core::SharedRingBuffer;
use canopy_core::StateChange;
use canopy_core::TerminalRegistration;
use canopy_core::TerminalUpdate;
use canopy_core::WorkerEnvelope;
use canopy_core::WorkerEvent;
use canopy_core::WorkerFactory;
use canopy_core::WorkerHandle;
use canopy_core::WorkerOutput;
use canopy_core::WorkerRequest;
use chrono::DateTime;
use chrono::Utc;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::AnalysisError;
use crate::events::EventBus;
use crate::ports::Clock;
use crate::ports::SharedBufferSource;
use crate::ports::Scheduler;

pub const CRASH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    Ready,
    Pong,
    StateChanged(StateChange),
    ArtifactsDetected(ArtifactBatch),
    Error {
        error: String,
        context: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Initializing,
    Running,
}

struct ServiceState {
    phase: Phase,
    worker: Option<Box<dyn WorkerHandle>>,
    generation: u64,
    ready: bool,
    buffer: Option<SharedRingBuffer>,
    registrations: Vec<TerminalRegistration>,
    /// Registrations go to the worker on its `READY` instead of immediately.
    replay_on_ready: bool,
    last_pong: Option<DateTime<Utc>>,
    attempt: u64,
    outcome: Option<(u64, Result<(), AnalysisError>)>,
    disposals: u64,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            worker: None,
            generation: 0,
            ready: false,
            buffer: None,
            registrations: Vec::new(),
            replay_on_ready: false,
            last_pong: None,
            attempt: 0,
            outcome: None,
            disposals: 0,
        }
    }
}

struct ServiceInner {
    factory: Arc<dyn WorkerFactory>,
    buffers: Arc<dyn SharedBufferSource>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    events: EventBus<AnalysisEvent>,
    state: Mutex<ServiceState>,
    settled: Condvar,
    outputs_tx: Sender<WorkerEnvelope>,
    outputs_rx: Receiver<WorkerEnvelope>,
}

/// A spawned worker and the ring it will read.
type Started = (Box<dyn WorkerHandle>, SharedRingBuffer);

/// What `handle` decided under the lock, carried out after releasing it.
enum Action {
    Publish(AnalysisEvent),
    Crash {
        worker: Option<Box<dyn WorkerHandle>>,
        reason: String,
        disposals: u64,
    },
    Nothing,
}

#[derive(Clone)]
pub struct SemanticAnalysisService {
    inner: Arc<ServiceInner>,
}

impl SemanticAnalysisService {
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        buffers: Arc<dyn SharedBufferSource>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (outputs_tx, outputs_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(ServiceInner {
                factory,
                buffers,
                scheduler,
                clock,
                events: EventBus::new("analysis"),
                state: Mutex::new(ServiceState::default()),
                settled: Condvar::new(),
                outputs_tx,
                outputs_rx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        mutex_lock_or_recover(&self.inner.state)
    }

    pub fn events(&self) -> &EventBus<AnalysisEvent> {
        &self.inner.events
    }

    pub fn is_initialized(&self) -> bool {
        self.state().phase == Phase::Running
    }

    /// Whether the current worker has reported `READY`.
    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn registrations(&self) -> Vec<TerminalRegistration> {
        self.state().registrations.clone()
    }

    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.state().last_pong
    }

    /// Start the worker. Concurrent callers share one attempt and all see
    /// its outcome. A failed attempt leaves the service uninitialized, so
    /// calling again later retries.
    pub fn initialize(&self) -> Result<(), AnalysisError> {
        let mut state = self.state();
        match state.phase {
            Phase::Running => return Ok(()),
            Phase::Initializing => {
                let attempt = state.attempt;
                while state.phase == Phase::Initializing && state.attempt == attempt {
                    state = self
                        .inner
                        .settled
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                return match &state.outcome {
                    Some((settled, outcome)) if *settled == attempt => outcome.clone(),
                    _ if state.phase == Phase::Running => Ok(()),
                    _ => Err(AnalysisError::NotInitialized),
                };
            }
            Phase::Uninitialized => {}
        }

        state.phase = Phase::Initializing;
        state.attempt += 1;
        state.generation += 1;
        state.ready = false;
        state.replay_on_ready = false;
        let attempt = state.attempt;
        let generation = state.generation;
        drop(state);

        let started = self.start_worker(generation);
        let outcome = self.settle(attempt, generation, started);
        if let Err(e) = &outcome {
            warn!(error = %e, "Semantic analysis disabled");
            self.inner.events.publish(&AnalysisEvent::Error {
                error: e.to_string(),
                context: Some("initialize".to_string()),
            });
        } else {
            info!(generation, "Semantic analysis worker started");
        }
        outcome
    }

    /// Install the started worker if its generation is still current,
    /// record the outcome and wake anyone waiting on it.
    fn settle(
        &self,
        attempt: u64,
        generation: u64,
        started: Result<Started, AnalysisError>,
    ) -> Result<(), AnalysisError> {
        let mut state = self.state();
        let mut discard = None;
        let outcome = match started {
            Ok((worker, buffer)) if state.generation == generation => {
                match install(&mut state, worker, buffer) {
                    Ok(()) => {
                        state.phase = Phase::Running;
                        Ok(())
                    }
                    Err((worker, e)) => {
                        state.phase = Phase::Uninitialized;
                        discard = Some(worker);
                        Err(e)
                    }
                }
            }
            Ok((worker, _)) => {
                // Disposed while starting.
                discard = Some(worker);
                Err(AnalysisError::NotInitialized)
            }
            Err(e) => {
                if state.generation == generation {
                    state.phase = Phase::Uninitialized;
                }
                Err(e)
            }
        };
        state.outcome = Some((attempt, outcome.clone()));
        drop(state);
        if let Some(worker) = discard {
            worker.terminate();
        }
        self.inner.settled.notify_all();
        outcome
    }

    fn acquire_buffer(&self) -> Result<SharedRingBuffer, AnalysisError> {
        if let Some(buffer) = self.state().buffer.clone() {
            return Ok(buffer);
        }
        let buffer = self
            .inner
            .buffers
            .acquire_shared_buffer()?
            .ok_or(AnalysisError::BufferUnavailable)?;
        self.state().buffer = Some(buffer.clone());
        Ok(buffer)
    }

    /// Spawn a worker and make sure the ring exists for it.
    fn start_worker(&self, generation: u64) -> Result<Started, AnalysisError> {
        let worker = self
            .inner
            .factory
            .spawn(generation, self.inner.outputs_tx.clone())?;
        match self.acquire_buffer() {
            Ok(buffer) => Ok((worker, buffer)),
            Err(e) => {
                worker.terminate();
                Err(e)
            }
        }
    }

    /// Process every envelope already waiting. Returns how many events were
    /// delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while let Ok(envelope) = self.inner.outputs_rx.try_recv() {
            delivered += self.handle(envelope);
        }
        delivered
    }

    /// Like [`pump`](Self::pump), waiting up to `timeout` for the first
    /// envelope.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        match self.inner.outputs_rx.recv_timeout(timeout) {
            Ok(envelope) => self.handle(envelope) + self.pump(),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    fn handle(&self, envelope: WorkerEnvelope) -> usize {
        let action = {
            let mut state = self.state();
            if envelope.generation != state.generation {
                debug!(
                    stale = envelope.generation,
                    current = state.generation,
                    "Dropped output from replaced worker"
                );
                return 0;
            }
            match envelope.output {
                WorkerOutput::Event(WorkerEvent::Ready) => {
                    state.ready = true;
                    if state.replay_on_ready && replay_registrations(&state) {
                        state.replay_on_ready = false;
                    }
                    Action::Publish(AnalysisEvent::Ready)
                }
                WorkerOutput::Event(WorkerEvent::Pong) => {
                    state.last_pong = Some(self.inner.clock.now());
                    Action::Publish(AnalysisEvent::Pong)
                }
                WorkerOutput::Event(WorkerEvent::StateChanged(change)) => {
                    Action::Publish(AnalysisEvent::StateChanged(change))
                }
                WorkerOutput::Event(WorkerEvent::ArtifactDetected(batch)) => {
                    Action::Publish(AnalysisEvent::ArtifactsDetected(batch))
                }
                WorkerOutput::Event(WorkerEvent::Error(failure)) => {
                    Action::Publish(AnalysisEvent::Error {
                        error: failure.error,
                        context: failure.context,
                    })
                }
                WorkerOutput::Crashed(reason) if state.phase == Phase::Running => {
                    state.phase = Phase::Uninitialized;
                    state.ready = false;
                    Action::Crash {
                        worker: state.worker.take(),
                        reason,
                        disposals: state.disposals,
                    }
                }
                WorkerOutput::Crashed(_) => Action::Nothing,
            }
        };

        match action {
            Action::Publish(event) => {
                self.inner.events.publish(&event);
                1
            }
            Action::Crash {
                worker,
                reason,
                disposals,
            } => {
                if let Some(worker) = worker {
                    worker.terminate();
                }
                error!(reason = %reason, "Analysis worker crashed; retrying once");
                self.inner.events.publish(&AnalysisEvent::Error {
                    error: reason,
                    context: Some("worker_crash".to_string()),
                });
                self.schedule_recovery(disposals);
                1
            }
            Action::Nothing => 0,
        }
    }

    fn schedule_recovery(&self, disposals: u64) {
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(
            "analysis-recover",
            CRASH_RETRY_DELAY,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    SemanticAnalysisService { inner }.recover(disposals);
                }
            }),
        );
    }

    /// The one retry after a crash. A failure is reported and left alone.
    fn recover(&self, disposals: u64) {
        let (attempt, generation) = {
            let mut state = self.state();
            if state.disposals != disposals || state.phase != Phase::Uninitialized {
                debug!("Recovery skipped; service was disposed or restarted");
                return;
            }
            state.phase = Phase::Initializing;
            state.attempt += 1;
            state.generation += 1;
            state.ready = false;
            state.replay_on_ready = true;
            (state.attempt, state.generation)
        };

        let started = self.start_worker(generation);
        match self.settle(attempt, generation, started) {
            Ok(()) => info!(generation, "Analysis worker restarted"),
            Err(e) => {
                error!(error = %e, "Analysis worker recovery failed");
                self.inner.events.publish(&AnalysisEvent::Error {
                    error: e.to_string(),
                    context: Some("recovery".to_string()),
                });
            }
        }
    }

    fn post(&self, state: &ServiceState, request: WorkerRequest) -> Result<(), AnalysisError> {
        match &state.worker {
            Some(worker) if !state.replay_on_ready => Ok(worker.post(request)?),
            _ => Ok(()),
        }
    }

    /// Cache the registration (one per terminal id) and forward it to the
    /// worker when one is running.
    pub fn register_terminal(&self, registration: TerminalRegistration) -> Result<(), AnalysisError> {
        let mut state = self.state();
        match state
            .registrations
            .iter_mut()
            .find(|r| r.terminal_id == registration.terminal_id)
        {
            Some(existing) => *existing = registration.clone(),
            None => state.registrations.push(registration.clone()),
        }
        self.post(&state, WorkerRequest::RegisterTerminal(registration))
    }

    pub fn update_terminal(&self, update: TerminalUpdate) -> Result<(), AnalysisError> {
        let mut state = self.state();
        if let Some(existing) = state
            .registrations
            .iter_mut()
            .find(|r| r.terminal_id == update.terminal_id)
        {
            if let Some(agent_id) = &update.agent_id {
                existing.agent_id = Some(agent_id.clone());
            }
            if let Some(worktree_id) = &update.worktree_id {
                existing.worktree_id = worktree_id.clone();
            }
            if let Some(trace_id) = &update.trace_id {
                existing.trace_id = Some(trace_id.clone());
            }
        }
        self.post(&state, WorkerRequest::UpdateTerminal(update))
    }

    pub fn unregister_terminal(&self, terminal_id: &str) -> Result<(), AnalysisError> {
        let mut state = self.state();
        state.registrations.retain(|r| r.terminal_id != terminal_id);
        self.post(
            &state,
            WorkerRequest::UnregisterTerminal {
                terminal_id: terminal_id.to_string(),
            },
        )
    }

    /// Forget every registration, here and in the worker.
    pub fn reset(&self) -> Result<(), AnalysisError> {
        let mut state = self.state();
        state.registrations.clear();
        self.post(&state, WorkerRequest::Reset)
    }

    pub fn ping(&self) -> Result<(), AnalysisError> {
        let state = self.state();
        match &state.worker {
            Some(worker) => Ok(worker.post(WorkerRequest::Ping)?),
            None => Err(AnalysisError::NotInitialized),
        }
    }

    /// Stop the worker and drop all cached state. A pending crash retry
    /// becomes a no-op; `initialize` may be called again afterwards.
    pub fn dispose(&self) {
        let worker = {
            let mut state = self.state();
            state.disposals += 1;
            state.generation += 1;
            state.phase = Phase::Uninitialized;
            state.ready = false;
            state.replay_on_ready = false;
            state.registrations.clear();
            state.buffer = None;
            state.worker.take()
        };
        if let Some(worker) = worker {
            worker.terminate();
        }
        self.inner.settled.notify_all();
        debug!("Semantic analysis service disposed");
    }
}

/// Hand `worker` the ring and make it the current worker. Runs under the
/// state lock, so its `READY` is handled only after it is installed and a
/// registration cannot slip in between the replay and the install.
fn install(
    state: &mut ServiceState,
    worker: Box<dyn WorkerHandle>,
    buffer: SharedRingBuffer,
) -> Result<(), (Box<dyn WorkerHandle>, AnalysisError)> {
    if let Err(e) = worker.post(WorkerRequest::InitBuffer(buffer)) {
        return Err((worker, e.into()));
    }
    if !state.replay_on_ready {
        for registration in &state.registrations {
            if let Err(e) = worker.post(WorkerRequest::RegisterTerminal(registration.clone())) {
                return Err((worker, e.into()));
            }
        }
    }
    state.worker = Some(worker);
    Ok(())
}

/// Send every cached registration to the current worker. False when there
/// is no worker or it stopped accepting requests.
fn replay_registrations(state: &ServiceState) -> bool {
    let Some(worker) = &state.worker else {
        return false;
    };
    for registration in &state.registrations {
        if let Err(e) = worker.post(WorkerRequest::RegisterTerminal(registration.clone())) {
            warn!(terminal_id = %registration.terminal_id, error = %e, "Registration replay failed");
            return false;
        }
    }
    debug!(count = state.registrations.len(), "Registrations replayed");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeWorkerFactory;
    use crate::test_support::FixedClock;
    use crate::test_support::ManualScheduler;
    use crate::test_support::StaticBufferSource;
    use canopy_core::AgentState;
    use canopy_core::StateTrigger;
    use canopy_core::WorkerError;
    use std::sync::OnceLock;
    use std::thread;

    struct Fixture {
        service: SemanticAnalysisService,
        factory: FakeWorkerFactory,
        buffers: Arc<StaticBufferSource>,
        scheduler: Arc<ManualScheduler>,
        clock: Arc<FixedClock>,
        events: Arc<Mutex<Vec<AnalysisEvent>>>,
    }

    fn fixture_with(buffers: StaticBufferSource) -> Fixture {
        let factory = FakeWorkerFactory::new();
        let buffers = Arc::new(buffers);
        let scheduler = Arc::new(ManualScheduler::new());
        let clock = Arc::new(FixedClock::new());
        let service = SemanticAnalysisService::new(
            Arc::new(factory.clone()),
            buffers.clone(),
            scheduler.clone(),
            clock.clone(),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        service
            .events()
            .subscribe(move |e: &AnalysisEvent| sink.lock().unwrap().push(e.clone()));
        Fixture {
            service,
            factory,
            buffers,
            scheduler,
            clock,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(StaticBufferSource::available(4096))
    }

    fn state_change(id: &str) -> StateChange {
        StateChange {
            terminal_id: id.to_string(),
            agent_id: "claude".to_string(),
            state: AgentState::Working,
            previous_state: AgentState::Idle,
            timestamp: 0,
            trigger: StateTrigger::Busy,
            confidence: 0.8,
            worktree_id: None,
            trace_id: None,
        }
    }

    #[test]
    fn test_initialize_posts_buffer_and_becomes_ready() {
        let f = fixture();
        f.service.initialize().unwrap();

        assert!(f.service.is_initialized());
        assert_eq!(f.factory.request_kinds(0), vec!["INIT_BUFFER"]);
        assert!(!f.service.is_ready());

        f.service.pump();
        assert!(f.service.is_ready());
        assert_eq!(*f.events.lock().unwrap(), vec![AnalysisEvent::Ready]);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let f = fixture();
        f.service.initialize().unwrap();
        f.service.initialize().unwrap();
        assert_eq!(f.factory.spawn_count(), 1);
        assert_eq!(f.buffers.acquisitions(), 1);
    }

    #[test]
    fn test_concurrent_initialize_shares_one_attempt() {
        let f = fixture();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = f.service.clone();
                thread::spawn(move || service.initialize())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
        assert_eq!(f.factory.spawn_count(), 1);
    }

    #[test]
    fn test_missing_buffer_disables_analysis_but_allows_retry() {
        let f = fixture_with(StaticBufferSource::unsupported());
        assert_eq!(f.service.initialize(), Err(AnalysisError::BufferUnavailable));
        assert!(!f.service.is_initialized());
        assert!(f.factory.is_terminated(0));
        assert!(matches!(
            f.events.lock().unwrap().last(),
            Some(AnalysisEvent::Error { .. })
        ));

        f.buffers.make_available(4096);
        f.service.initialize().unwrap();
        assert!(f.service.is_initialized());
        assert_eq!(f.factory.spawn_count(), 2);
    }

    #[test]
    fn test_registrations_before_initialize_are_sent_after_buffer() {
        let f = fixture();
        f.service
            .register_terminal(TerminalRegistration::new("t1").with_agent("claude"))
            .unwrap();
        f.service.initialize().unwrap();

        assert_eq!(
            f.factory.request_kinds(0),
            vec!["INIT_BUFFER", "REGISTER_TERMINAL"]
        );
    }

    #[test]
    fn test_registration_cache_keeps_one_record_per_terminal() {
        let f = fixture();
        f.service
            .register_terminal(TerminalRegistration::new("t1"))
            .unwrap();
        f.service
            .register_terminal(TerminalRegistration::new("t1").with_agent("codex"))
            .unwrap();

        let registrations = f.service.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].agent_id.as_deref(), Some("codex"));
    }

    #[test]
    fn test_update_merges_into_cached_registration() {
        let f = fixture();
        f.service
            .register_terminal(TerminalRegistration::new("t1").with_agent("claude"))
            .unwrap();
        f.service
            .update_terminal(TerminalUpdate {
                terminal_id: "t1".to_string(),
                worktree_id: Some(Some("wt".to_string())),
                ..TerminalUpdate::default()
            })
            .unwrap();

        let registration = &f.service.registrations()[0];
        assert_eq!(registration.agent_id.as_deref(), Some("claude"));
        assert_eq!(registration.worktree_id.as_deref(), Some("wt"));

        f.service
            .update_terminal(TerminalUpdate {
                terminal_id: "t1".to_string(),
                worktree_id: Some(None),
                ..TerminalUpdate::default()
            })
            .unwrap();
        assert_eq!(f.service.registrations()[0].worktree_id, None);
    }

    #[test]
    fn test_crash_retries_once_and_replays_registrations_on_ready() {
        let f = fixture();
        f.service.initialize().unwrap();
        f.service.pump();
        for id in ["t1", "t2"] {
            f.service
                .register_terminal(TerminalRegistration::new(id))
                .unwrap();
        }

        f.factory.crash(0, "boom");
        f.service.pump();
        assert!(!f.service.is_initialized());
        assert!(f.factory.is_terminated(0));
        assert_eq!(
            f.scheduler.pending(),
            vec![("analysis-recover", CRASH_RETRY_DELAY)]
        );

        f.scheduler.run_all();
        assert_eq!(f.factory.spawn_count(), 2);
        assert!(f.service.is_initialized());
        // Nothing replayed until the new worker says READY.
        assert_eq!(f.factory.request_kinds(1), vec!["INIT_BUFFER"]);

        f.service.pump();
        assert_eq!(f.factory.registered_ids(1), vec!["t1", "t2"]);
        assert_eq!(f.buffers.acquisitions(), 1);
    }

    #[test]
    fn test_failed_recovery_is_reported_not_retried() {
        let f = fixture();
        f.service.initialize().unwrap();
        f.factory.crash(0, "boom");
        f.service.pump();

        f.factory.fail_next_spawn("no threads");
        f.scheduler.run_all();

        assert!(!f.service.is_initialized());
        assert_eq!(f.scheduler.pending_count(), 0);
        let events = f.events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(AnalysisEvent::Error { context: Some(context), .. }) if context == "recovery"
        ));
    }

    #[test]
    fn test_output_from_replaced_worker_is_dropped() {
        let f = fixture();
        f.service.initialize().unwrap();
        f.factory.crash(0, "boom");
        f.service.pump();
        f.scheduler.run_all();
        f.service.pump();
        f.events.lock().unwrap().clear();

        f.factory
            .emit(0, WorkerEvent::StateChanged(state_change("t1")));
        assert_eq!(f.service.pump(), 0);

        f.factory
            .emit(1, WorkerEvent::StateChanged(state_change("t1")));
        assert_eq!(f.service.pump(), 1);
        assert_eq!(
            *f.events.lock().unwrap(),
            vec![AnalysisEvent::StateChanged(state_change("t1"))]
        );
    }

    #[test]
    fn test_ping_records_pong_time() {
        let f = fixture();
        assert_eq!(f.service.ping(), Err(AnalysisError::NotInitialized));

        f.service.initialize().unwrap();
        f.service.ping().unwrap();
        f.service.pump();
        assert_eq!(f.service.last_pong(), Some(f.clock.now()));
    }

    #[test]
    fn test_dispose_cancels_pending_recovery_and_allows_reinitialize() {
        let f = fixture();
        f.service.initialize().unwrap();
        f.service
            .register_terminal(TerminalRegistration::new("t1"))
            .unwrap();
        f.factory.crash(0, "boom");
        f.service.pump();

        f.service.dispose();
        f.scheduler.run_all();
        assert_eq!(f.factory.spawn_count(), 1);
        assert!(f.service.registrations().is_empty());

        f.service.initialize().unwrap();
        assert_eq!(f.factory.spawn_count(), 2);
        assert_eq!(f.buffers.acquisitions(), 2);
    }

    #[test]
    fn test_artifact_and_error_events_are_forwarded() {
        let f = fixture();
        f.service.initialize().unwrap();
        f.service.pump();
        f.events.lock().unwrap().clear();

        let batch = ArtifactBatch {
            terminal_id: "t1".to_string(),
            artifacts: Vec::new(),
        };
        f.factory
            .emit(0, WorkerEvent::ArtifactDetected(batch.clone()));
        f.factory.emit(
            0,
            WorkerEvent::Error(canopy_core::WorkerFailure {
                error: "ring overflow".to_string(),
                context: Some("ring_buffer".to_string()),
            }),
        );
        f.service.pump();

        assert_eq!(
            *f.events.lock().unwrap(),
            vec![
                AnalysisEvent::ArtifactsDetected(batch),
                AnalysisEvent::Error {
                    error: "ring overflow".to_string(),
                    context: Some("ring_buffer".to_string()),
                },
            ]
        );
    }

    type Hook = Arc<dyn Fn(&SemanticAnalysisService) + Send + Sync>;

    /// Wraps the fake so a second thread acts on the service as soon as
    /// `INIT_BUFFER` has been posted to a worker.
    #[derive(Clone, Default)]
    struct ConcurrentInitFactory {
        fake: FakeWorkerFactory,
        service: Arc<OnceLock<SemanticAnalysisService>>,
        hook: Arc<Mutex<Option<Hook>>>,
        threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    }

    impl ConcurrentInitFactory {
        fn on_init(&self, hook: impl Fn(&SemanticAnalysisService) + Send + Sync + 'static) {
            *self.hook.lock().unwrap() = Some(Arc::new(hook));
        }

        fn join(&self) {
            let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
            for thread in threads {
                thread.join().unwrap();
            }
        }
    }

    impl WorkerFactory for ConcurrentInitFactory {
        fn spawn(
            &self,
            generation: u64,
            outputs: Sender<WorkerEnvelope>,
        ) -> Result<Box<dyn WorkerHandle>, WorkerError> {
            Ok(Box::new(ConcurrentInitHandle {
                inner: self.fake.spawn(generation, outputs)?,
                factory: self.clone(),
            }))
        }
    }

    struct ConcurrentInitHandle {
        inner: Box<dyn WorkerHandle>,
        factory: ConcurrentInitFactory,
    }

    impl WorkerHandle for ConcurrentInitHandle {
        fn post(&self, request: WorkerRequest) -> Result<(), WorkerError> {
            let init = matches!(request, WorkerRequest::InitBuffer(_));
            self.inner.post(request)?;
            let hook = self.factory.hook.lock().unwrap().clone();
            if let (true, Some(hook), Some(service)) = (init, hook, self.factory.service.get()) {
                let service = service.clone();
                self.factory
                    .threads
                    .lock()
                    .unwrap()
                    .push(thread::spawn(move || hook(&service)));
            }
            Ok(())
        }

        fn terminate(self: Box<Self>) {
            self.inner.terminate();
        }
    }

    fn concurrent_fixture() -> (SemanticAnalysisService, ConcurrentInitFactory, Arc<ManualScheduler>) {
        let factory = ConcurrentInitFactory::default();
        let scheduler = Arc::new(ManualScheduler::new());
        let service = SemanticAnalysisService::new(
            Arc::new(factory.clone()),
            Arc::new(StaticBufferSource::available(4096)),
            scheduler.clone(),
            Arc::new(FixedClock::new()),
        );
        assert!(factory.service.set(service.clone()).is_ok());
        (service, factory, scheduler)
    }

    #[test]
    fn test_ready_pumped_on_another_thread_during_recovery_still_replays() {
        let (service, factory, scheduler) = concurrent_fixture();
        service.initialize().unwrap();
        service.pump();
        for id in ["t1", "t2"] {
            service
                .register_terminal(TerminalRegistration::new(id))
                .unwrap();
        }

        factory.on_init(|service| {
            service.pump();
        });
        factory.fake.crash(0, "boom");
        service.pump();
        scheduler.run_all();
        factory.join();

        assert!(service.is_ready());
        assert_eq!(factory.fake.registered_ids(1), vec!["t1", "t2"]);
    }

    #[test]
    fn test_registration_racing_first_start_reaches_the_worker() {
        let (service, factory, _scheduler) = concurrent_fixture();
        factory.on_init(|service| {
            service
                .register_terminal(TerminalRegistration::new("t1"))
                .unwrap();
        });

        service.initialize().unwrap();
        factory.join();

        assert_eq!(factory.fake.registered_ids(0), vec!["t1"]);
        assert_eq!(service.registrations().len(), 1);
    }

    #[test]
    fn test_replay_reports_whether_it_reached_a_worker() {
        let f = fixture();
        let mut state = ServiceState {
            replay_on_ready: true,
            registrations: vec![TerminalRegistration::new("t1")],
            ..ServiceState::default()
        };
        assert!(!replay_registrations(&state));

        let worker = f
            .factory
            .spawn(0, crossbeam_channel::unbounded().0)
            .unwrap();
        state.worker = Some(worker);
        assert!(replay_registrations(&state));
        assert_eq!(f.factory.registered_ids(0), vec!["t1"]);
    }
}
