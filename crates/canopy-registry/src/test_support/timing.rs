use std::sync::Mutex;
use std::time::Duration;

use canopy_common::mutex_lock_or_recover;
use chrono::DateTime;
use chrono::Utc;

use crate::ports::Clock;
use crate::ports::Scheduler;
use crate::ports::Task;

struct PendingTask {
    name: &'static str,
    delay: Duration,
    task: Task,
}

/// Queues deferred tasks until the test runs them.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<PendingTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<(&'static str, Duration)> {
        mutex_lock_or_recover(&self.pending)
            .iter()
            .map(|p| (p.name, p.delay))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        mutex_lock_or_recover(&self.pending).len()
    }

    /// Run every task queued so far, in scheduling order. Tasks they schedule
    /// stay queued. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let batch: Vec<PendingTask> = std::mem::take(&mut *mutex_lock_or_recover(&self.pending));
        let ran = batch.len();
        for pending in batch {
            (pending.task)();
        }
        ran
    }

    /// Drop queued tasks without running them.
    pub fn discard_all(&self) -> usize {
        std::mem::take(&mut *mutex_lock_or_recover(&self.pending)).len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, name: &'static str, delay: Duration, task: Task) {
        mutex_lock_or_recover(&self.pending).push(PendingTask { name, delay, task });
    }
}

/// A clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// 2026-01-01T00:00:00Z.
    pub fn new() -> Self {
        Self::at(DateTime::<Utc>::default() + chrono::Duration::seconds(1_767_225_600))
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        *mutex_lock_or_recover(&self.now) += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *mutex_lock_or_recover(&self.now)
    }
}
