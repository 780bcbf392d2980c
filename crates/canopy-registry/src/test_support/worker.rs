use std::sync::Arc;
use std::sync::Mutex;

use canopy_common::mutex_lock_or_recover;
use canopy_core::WorkerEnvelope;
use canopy_core::WorkerError;
use canopy_core::WorkerEvent;
use canopy_core::WorkerFactory;
use canopy_core::WorkerHandle;
use canopy_core::WorkerRequest;
use crossbeam_channel::Sender;

struct FakeWorker {
    generation: u64,
    outputs: Sender<WorkerEnvelope>,
    requests: Vec<WorkerRequest>,
    terminated: bool,
}

#[derive(Default)]
struct FakeWorkers {
    workers: Vec<FakeWorker>,
    spawn_error: Option<String>,
    manual: bool,
}

/// Builds in-process fake workers whose traffic tests can inspect and drive.
///
/// By default a fake answers `INIT_BUFFER` with `READY` and `PING` with
/// `PONG`; [`FakeWorkerFactory::manual`] turns that off.
#[derive(Clone, Default)]
pub struct FakeWorkerFactory {
    inner: Arc<Mutex<FakeWorkers>>,
}

impl FakeWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manual() -> Self {
        let factory = Self::default();
        mutex_lock_or_recover(&factory.inner).manual = true;
        factory
    }

    pub fn fail_next_spawn(&self, reason: impl Into<String>) {
        mutex_lock_or_recover(&self.inner).spawn_error = Some(reason.into());
    }

    pub fn spawn_count(&self) -> usize {
        mutex_lock_or_recover(&self.inner).workers.len()
    }

    pub fn generation(&self, index: usize) -> Option<u64> {
        mutex_lock_or_recover(&self.inner)
            .workers
            .get(index)
            .map(|w| w.generation)
    }

    /// Wire names of the requests worker `index` received.
    pub fn request_kinds(&self, index: usize) -> Vec<&'static str> {
        mutex_lock_or_recover(&self.inner)
            .workers
            .get(index)
            .map(|w| w.requests.iter().map(WorkerRequest::kind).collect())
            .unwrap_or_default()
    }

    /// Terminal ids worker `index` received `REGISTER_TERMINAL` for.
    pub fn registered_ids(&self, index: usize) -> Vec<String> {
        mutex_lock_or_recover(&self.inner)
            .workers
            .get(index)
            .map(|w| {
                w.requests
                    .iter()
                    .filter_map(|r| match r {
                        WorkerRequest::RegisterTerminal(reg) => Some(reg.terminal_id.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_terminated(&self, index: usize) -> bool {
        mutex_lock_or_recover(&self.inner)
            .workers
            .get(index)
            .is_some_and(|w| w.terminated)
    }

    /// Send `event` as if worker `index` produced it.
    pub fn emit(&self, index: usize, event: WorkerEvent) -> bool {
        let inner = mutex_lock_or_recover(&self.inner);
        inner.workers.get(index).is_some_and(|w| {
            w.outputs
                .send(WorkerEnvelope::event(w.generation, event))
                .is_ok()
        })
    }

    /// Report a runtime crash of worker `index`.
    pub fn crash(&self, index: usize, reason: &str) -> bool {
        let inner = mutex_lock_or_recover(&self.inner);
        inner.workers.get(index).is_some_and(|w| {
            w.outputs
                .send(WorkerEnvelope::crashed(w.generation, reason))
                .is_ok()
        })
    }
}

impl WorkerFactory for FakeWorkerFactory {
    fn spawn(
        &self,
        generation: u64,
        outputs: Sender<WorkerEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        let mut inner = mutex_lock_or_recover(&self.inner);
        if let Some(reason) = inner.spawn_error.take() {
            return Err(WorkerError::Spawn(reason));
        }
        let index = inner.workers.len();
        inner.workers.push(FakeWorker {
            generation,
            outputs,
            requests: Vec::new(),
            terminated: false,
        });
        Ok(Box::new(FakeWorkerHandle {
            inner: Arc::clone(&self.inner),
            index,
        }))
    }
}

struct FakeWorkerHandle {
    inner: Arc<Mutex<FakeWorkers>>,
    index: usize,
}

impl WorkerHandle for FakeWorkerHandle {
    fn post(&self, request: WorkerRequest) -> Result<(), WorkerError> {
        let mut inner = mutex_lock_or_recover(&self.inner);
        let manual = inner.manual;
        let Some(worker) = inner.workers.get_mut(self.index) else {
            return Err(WorkerError::Disconnected(request.kind()));
        };
        if worker.terminated {
            return Err(WorkerError::Disconnected(request.kind()));
        }
        let reply = match &request {
            WorkerRequest::InitBuffer(_) if !manual => Some(WorkerEvent::Ready),
            WorkerRequest::Ping if !manual => Some(WorkerEvent::Pong),
            _ => None,
        };
        worker.requests.push(request);
        if let Some(event) = reply {
            // The host may already be gone; nothing to report to then.
            let _ = worker
                .outputs
                .send(WorkerEnvelope::event(worker.generation, event));
        }
        Ok(())
    }

    fn terminate(self: Box<Self>) {
        if let Some(worker) = mutex_lock_or_recover(&self.inner)
            .workers
            .get_mut(self.index)
        {
            worker.terminated = true;
        }
    }
}
