//! Rebuilding the registry from persisted state.

use std::sync::Arc;

use canopy_core::AgentState;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DEFAULT_COLS;
use super::DEFAULT_ROWS;
use super::TerminalRegistry;
use super::grid_count_in;
use super::warn_on_error;
use crate::domain::PanelLocation;
use crate::domain::PersistedState;
use crate::domain::PersistedTerminal;
use crate::domain::TerminalInstance;
use crate::error::RegistryError;
use crate::events::RegistryEvent;
use crate::ports::RenderPolicy;
use crate::ports::SpawnRequest;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrationReport {
    /// Still-running processes that were reattached.
    pub reconnected: Vec<String>,
    /// Processes started again from their persisted command.
    pub respawned: Vec<String>,
    pub failed: Vec<(String, RegistryError)>,
    /// Grid terminals placed in the dock because their worktree was full.
    pub docked_overflow: Vec<String>,
    pub repaired_groups: usize,
}

fn instance_from(persisted: PersistedTerminal, pid: Option<u32>) -> TerminalInstance {
    // Trashed entries are never persisted; anything claiming otherwise is docked.
    let location = match persisted.location {
        PanelLocation::Trash => PanelLocation::Dock,
        other => other,
    };
    TerminalInstance {
        agent_state: persisted.agent_id.as_ref().map(|_| AgentState::Idle),
        id: persisted.id,
        kind: persisted.kind,
        agent_id: persisted.agent_id,
        title: persisted.title,
        cwd: persisted.cwd,
        cols: DEFAULT_COLS,
        rows: DEFAULT_ROWS,
        worktree_id: persisted.worktree_id,
        location,
        is_visible: location.is_visible(),
        last_state_change: None,
        state_change_trigger: None,
        state_change_confidence: None,
        activity: None,
        command: persisted.command,
        pid,
    }
}

impl TerminalRegistry {
    /// Load `state` into the registry. Ids in `live` belong to processes
    /// that survived and are reconnected; the rest are respawned. A terminal
    /// whose respawn fails is reported and left out.
    pub fn hydrate(&self, state: PersistedState, live: &[String]) -> HydrationReport {
        let mut report = HydrationReport::default();
        let mut restored = Vec::with_capacity(state.terminals.len());

        for persisted in state.terminals {
            if !self.reserve(&persisted.id) {
                debug!(terminal_id = %persisted.id, "Terminal already present; not restored");
                continue;
            }
            let id = persisted.id.clone();
            if live.contains(&id) {
                warn_on_error(&id, self.ports.bridge.reconnect(&id));
                report.reconnected.push(id);
                restored.push(instance_from(persisted, None));
                continue;
            }

            let request = SpawnRequest {
                id: id.clone(),
                kind: persisted.kind,
                command: persisted.command.clone(),
                cwd: persisted.cwd.clone(),
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
                env: Vec::new(),
            };
            match self.ports.bridge.spawn(&request) {
                Ok(spawned) => {
                    report.respawned.push(id);
                    restored.push(instance_from(persisted, spawned.pid));
                }
                Err(e) => {
                    self.write().spawning.remove(&id);
                    warn!(terminal_id = %id, error = %e, "Failed to respawn persisted terminal");
                    report.failed.push((id, RegistryError::Spawn(e)));
                }
            }
        }

        let added: Vec<(String, PanelLocation)> = {
            let mut guard = self.write();
            let mut next = (*guard.terminals).clone();
            let mut added = Vec::with_capacity(restored.len());
            for mut instance in restored {
                guard.spawning.remove(&instance.id);
                if instance.occupies_grid()
                    && grid_count_in(&next, instance.worktree_id.as_deref())
                        >= self.config.max_grid_terminals
                {
                    instance.place(PanelLocation::Dock);
                    report.docked_overflow.push(instance.id.clone());
                }
                added.push((instance.id.clone(), instance.location));
                next.push(instance);
            }
            guard.terminals = Arc::new(next);
            added
        };

        for (id, location) in &added {
            if location.is_visible() {
                self.ports.renderer.apply(id, RenderPolicy::Visible);
            } else {
                warn_on_error(id, self.ports.bridge.set_buffering(id, true));
                self.ports.renderer.apply(id, RenderPolicy::Background);
            }
        }
        for id in &report.reconnected {
            if let Some(lines) = warn_on_error(
                id,
                self.ports
                    .bridge
                    .replay_history(id, self.config.replay_history_lines),
            ) {
                info!(terminal_id = %id, lines, "Replayed terminal history");
            }
        }
        for (id, _) in &added {
            self.events
                .publish(&RegistryEvent::TerminalAdded { id: id.clone() });
        }

        report.repaired_groups = self.hydrate_tab_groups(state.tab_groups);
        self.persist_terminals();
        self.persist_tab_groups();

        info!(
            reconnected = report.reconnected.len(),
            respawned = report.respawned.len(),
            failed = report.failed.len(),
            docked = report.docked_overflow.len(),
            "Registry hydrated"
        );
        report
    }
}
