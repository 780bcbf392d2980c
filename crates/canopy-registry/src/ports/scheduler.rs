//! Deferred work: the post-move flush and the worker crash retry.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::debug;
use tracing::info_span;
use tracing::warn;

use crate::sleeper::RealSleeper;
use crate::sleeper::Sleeper;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`. Callers must not hold registry locks.
    fn schedule(&self, name: &'static str, delay: Duration, task: Task);
}

/// Runs every task on its own short-lived named thread.
#[derive(Clone)]
pub struct ThreadScheduler {
    sleeper: Arc<dyn Sleeper>,
}

impl ThreadScheduler {
    pub fn new(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new(Arc::new(RealSleeper))
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, name: &'static str, delay: Duration, task: Task) {
        let sleeper = Arc::clone(&self.sleeper);
        let spawned = thread::Builder::new()
            .name(format!("deferred-{name}"))
            .spawn(move || {
                let span = info_span!("deferred_task", task = name);
                let _enter = span.enter();
                sleeper.sleep(delay);
                debug!(?delay, "Running deferred task");
                task();
            });

        if let Err(e) = spawned {
            warn!(task = name, error = %e, "Failed to spawn deferred task thread");
        }
    }
}
