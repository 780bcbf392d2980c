//! Readiness-gated writes for automation.
//!
//! User input is written straight through. Automation input joins a
//! per-terminal FIFO whose head is written whenever the target agent is
//! ready (idle or waiting): on each readiness transition and on each new
//! automation command.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use canopy_common::mutex_lock_or_recover;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::domain::CommandOrigin;
use crate::domain::QueuedCommand;
use crate::error::QueueError;
use crate::ports::Clock;
use crate::registry::TerminalRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Written,
    /// Zero-based position in the terminal's queue.
    Queued { position: usize },
}

pub struct CommandQueue {
    registry: Arc<TerminalRegistry>,
    clock: Arc<dyn Clock>,
    queues: Mutex<HashMap<String, VecDeque<QueuedCommand>>>,
}

impl CommandQueue {
    pub fn new(registry: Arc<TerminalRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, VecDeque<QueuedCommand>>> {
        mutex_lock_or_recover(&self.queues)
    }

    fn write(&self, terminal_id: &str, payload: &str) -> Result<(), QueueError> {
        self.registry
            .write_to_terminal(terminal_id, payload.as_bytes())
            .map_err(|e| QueueError::from_registry(terminal_id, e))
    }

    pub fn queue_command(
        &self,
        terminal_id: &str,
        payload: impl Into<String>,
        description: impl Into<String>,
        origin: CommandOrigin,
    ) -> Result<QueueOutcome, QueueError> {
        let payload = payload.into();
        let description = description.into();
        let instance = self
            .registry
            .get(terminal_id)
            .ok_or_else(|| QueueError::NotFound(terminal_id.to_string()))?;

        if origin == CommandOrigin::User {
            self.write(terminal_id, &payload)?;
            return Ok(QueueOutcome::Written);
        }

        let command = QueuedCommand {
            id: Uuid::new_v4().to_string(),
            terminal_id: terminal_id.to_string(),
            payload,
            description,
            queued_at: self.clock.now(),
            origin,
        };
        let id = command.id.clone();
        self.queues()
            .entry(terminal_id.to_string())
            .or_default()
            .push_back(command);

        // A readiness transition may have drained before the push.
        match self.process_queue(terminal_id) {
            Ok(Some(written)) if written.id == id => {
                debug!(terminal_id, description = %written.description, "Automation command written");
                return Ok(QueueOutcome::Written);
            }
            Ok(_) => {}
            Err(e) => {
                let mut queues = self.queues();
                if let Some(queue) = queues.get_mut(terminal_id) {
                    if queue.front().is_some_and(|head| head.id == id) {
                        queue.pop_front();
                        return Err(e);
                    }
                }
            }
        }

        let position = self
            .queues()
            .get(terminal_id)
            .and_then(|queue| queue.iter().position(|c| c.id == id));
        match position {
            Some(position) => {
                debug!(
                    terminal_id,
                    position,
                    state = ?instance.agent_state,
                    "Automation command queued"
                );
                Ok(QueueOutcome::Queued { position })
            }
            // Drained by a concurrent transition.
            None => Ok(QueueOutcome::Written),
        }
    }

    /// Write the oldest queued command if the terminal is ready. A failed
    /// write puts the command back at the head of the queue.
    pub fn process_queue(&self, terminal_id: &str) -> Result<Option<QueuedCommand>, QueueError> {
        let Some(instance) = self.registry.get(terminal_id) else {
            return Err(QueueError::NotFound(terminal_id.to_string()));
        };
        if !instance.is_ready() {
            debug!(terminal_id, state = ?instance.agent_state, "Terminal busy; queue held");
            return Ok(None);
        }

        let Some(command) = self
            .queues()
            .get_mut(terminal_id)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };

        match self.write(terminal_id, &command.payload) {
            Ok(()) => {
                debug!(terminal_id, description = %command.description, "Queued command written");
                Ok(Some(command))
            }
            Err(e) => {
                warn!(terminal_id, error = %e, "Queued command write failed; requeued");
                self.queues()
                    .entry(terminal_id.to_string())
                    .or_default()
                    .push_front(command);
                Err(e)
            }
        }
    }

    pub fn clear_queue(&self, terminal_id: &str) -> usize {
        let dropped = self.queues().remove(terminal_id).map_or(0, |q| q.len());
        if dropped > 0 {
            debug!(terminal_id, dropped, "Command queue cleared");
        }
        dropped
    }

    pub fn queue_len(&self, terminal_id: &str) -> usize {
        self.queues().get(terminal_id).map_or(0, VecDeque::len)
    }

    pub fn pending(&self, terminal_id: &str) -> Vec<QueuedCommand> {
        self.queues()
            .get(terminal_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}
