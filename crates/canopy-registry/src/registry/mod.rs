//! The canonical list of terminal instances.
//!
//! All state lives behind one `RwLock`. Every mutation builds a new
//! instance list and swaps the `Arc`, so readers holding a snapshot never
//! observe a half-applied operation. Calls into the terminal bridge happen
//! after the lock is released; apart from `spawn` their failures are logged
//! and the in-memory change stands.

mod hydrate;
mod placement;
mod tab_groups;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use canopy_common::rwlock_read_or_recover;
use canopy_common::rwlock_write_or_recover;
use canopy_core::AgentState;
use canopy_core::StateTrigger;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

pub use hydrate::HydrationReport;

use crate::config::RegistryConfig;
use crate::domain::Activity;
use crate::domain::PanelKind;
use crate::domain::PanelLocation;
use crate::domain::PersistedTabGroup;
use crate::domain::PersistedTerminal;
use crate::domain::TabGroup;
use crate::domain::TerminalInstance;
use crate::domain::TrashedTerminal;
use crate::error::BridgeError;
use crate::error::RegistryError;
use crate::events::EventBus;
use crate::events::RegistryEvent;
use crate::ports::Clock;
use crate::ports::RenderPolicy;
use crate::ports::RendererPolicy;
use crate::ports::Scheduler;
use crate::ports::SpawnRequest;
use crate::ports::StateStore;
use crate::ports::TerminalBridge;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Collaborators the registry calls out to.
#[derive(Clone)]
pub struct RegistryPorts {
    pub bridge: Arc<dyn TerminalBridge>,
    pub store: Arc<dyn StateStore>,
    pub renderer: Arc<dyn RendererPolicy>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct AddTerminalOptions {
    pub id: Option<String>,
    pub kind: PanelKind,
    pub title: Option<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub worktree_id: Option<String>,
    pub location: PanelLocation,
    pub agent_id: Option<String>,
    pub command: Option<String>,
    pub env: Vec<(String, String)>,
}

impl Default for AddTerminalOptions {
    fn default() -> Self {
        Self {
            id: None,
            kind: PanelKind::Terminal,
            title: None,
            cwd: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            worktree_id: None,
            location: PanelLocation::Grid,
            agent_id: None,
            command: None,
            env: Vec::new(),
        }
    }
}

impl AddTerminalOptions {
    pub fn new(kind: PanelKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn with_worktree(mut self, worktree_id: Option<String>) -> Self {
        self.worktree_id = worktree_id;
        self
    }

    pub fn with_location(mut self, location: PanelLocation) -> Self {
        self.location = location;
        self
    }

    /// Marks the terminal as hosting an agent; it starts out idle.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Default)]
struct RegistryState {
    project_id: Option<String>,
    terminals: Arc<Vec<TerminalInstance>>,
    groups: Arc<Vec<TabGroup>>,
    trash: HashMap<String, TrashedTerminal>,
    /// Ids whose process is being spawned but not yet recorded.
    spawning: HashSet<String>,
}

pub struct TerminalRegistry {
    state: RwLock<RegistryState>,
    ports: RegistryPorts,
    config: RegistryConfig,
    events: EventBus<RegistryEvent>,
}

fn position(terminals: &[TerminalInstance], id: &str) -> Option<usize> {
    terminals.iter().position(|t| t.id == id)
}

fn grid_count_in(terminals: &[TerminalInstance], scope: Option<&str>) -> usize {
    terminals
        .iter()
        .filter(|t| t.occupies_grid() && t.in_scope(scope))
        .count()
}

fn default_title(options: &AddTerminalOptions) -> String {
    if let Some(title) = &options.title {
        return title.clone();
    }
    if let Some(agent) = &options.agent_id {
        return agent.clone();
    }
    match &options.command {
        Some(command) => command
            .split_whitespace()
            .next()
            .unwrap_or(command.as_str())
            .to_string(),
        None => "Terminal".to_string(),
    }
}

/// Log a failed bridge call and carry on.
fn warn_on_error<T>(id: &str, result: Result<T, BridgeError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(terminal_id = %id, operation = e.operation(), error = %e, "Terminal bridge call failed");
            None
        }
    }
}

impl TerminalRegistry {
    pub fn new(ports: RegistryPorts, config: RegistryConfig) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            ports,
            config,
            events: EventBus::new("registry"),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        rwlock_read_or_recover(&self.state)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        rwlock_write_or_recover(&self.state)
    }

    pub fn events(&self) -> &EventBus<RegistryEvent> {
        &self.events
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn project_id(&self) -> Option<String> {
        self.read().project_id.clone()
    }

    pub fn set_project(&self, project_id: Option<String>) {
        self.write().project_id = project_id;
    }

    /// Immutable view of the instance list at this moment.
    pub fn snapshot(&self) -> Arc<Vec<TerminalInstance>> {
        Arc::clone(&self.read().terminals)
    }

    pub fn get(&self, id: &str) -> Option<TerminalInstance> {
        self.read().terminals.iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().terminals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn terminals_in(&self, scope: Option<&str>) -> Vec<TerminalInstance> {
        self.read()
            .terminals
            .iter()
            .filter(|t| t.in_scope(scope))
            .cloned()
            .collect()
    }

    pub fn grid_count(&self, scope: Option<&str>) -> usize {
        grid_count_in(&self.read().terminals, scope)
    }

    pub fn grid_capacity_remaining(&self, scope: Option<&str>) -> usize {
        self.config
            .max_grid_terminals
            .saturating_sub(self.grid_count(scope))
    }

    pub fn trashed(&self) -> Vec<TrashedTerminal> {
        let mut entries: Vec<_> = self.read().trash.values().cloned().collect();
        entries.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        entries
    }

    /// Claim `id` for a spawn in flight. False when a recorded terminal or
    /// another spawn already holds it.
    fn reserve(&self, id: &str) -> bool {
        let mut state = self.write();
        position(&state.terminals, id).is_none() && state.spawning.insert(id.to_string())
    }

    /// Spawns the backing process, then records the instance. A grid request
    /// that would overflow its worktree's grid lands in the dock instead.
    pub fn add_terminal(&self, options: AddTerminalOptions) -> Result<String, RegistryError> {
        if options.location == PanelLocation::Trash {
            return Err(RegistryError::InvalidPlacement(
                "new terminals cannot start in the trash".to_string(),
            ));
        }
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !self.reserve(&id) {
            return Err(RegistryError::InvalidPlacement(format!(
                "terminal {id} already exists"
            )));
        }

        let request = SpawnRequest {
            id: id.clone(),
            kind: options.kind,
            command: options.command.clone(),
            cwd: options.cwd.clone(),
            cols: options.cols,
            rows: options.rows,
            env: options.env.clone(),
        };
        let spawned = self.ports.bridge.spawn(&request).map_err(|e| {
            self.write().spawning.remove(&id);
            warn!(terminal_id = %id, error = %e, "Spawn failed; terminal not registered");
            RegistryError::Spawn(e)
        })?;

        let mut instance = TerminalInstance {
            id: id.clone(),
            kind: options.kind,
            agent_id: options.agent_id.clone(),
            title: default_title(&options),
            cwd: options.cwd,
            cols: options.cols,
            rows: options.rows,
            worktree_id: options.worktree_id,
            location: options.location,
            is_visible: options.location.is_visible(),
            agent_state: options.agent_id.as_ref().map(|_| AgentState::Idle),
            last_state_change: None,
            state_change_trigger: None,
            state_change_confidence: None,
            activity: None,
            command: options.command,
            pid: spawned.pid,
        };

        let location = {
            let mut state = self.write();
            state.spawning.remove(&id);
            if instance.occupies_grid()
                && grid_count_in(&state.terminals, instance.worktree_id.as_deref())
                    >= self.config.max_grid_terminals
            {
                debug!(terminal_id = %id, "Grid full; new terminal placed in dock");
                instance.place(PanelLocation::Dock);
            }
            let location = instance.location;
            let mut next = (*state.terminals).clone();
            next.push(instance);
            state.terminals = Arc::new(next);
            location
        };

        if location.is_visible() {
            self.ports.renderer.apply(&id, RenderPolicy::Visible);
        } else {
            warn_on_error(&id, self.ports.bridge.set_buffering(&id, true));
            self.ports.renderer.apply(&id, RenderPolicy::Background);
        }

        info!(terminal_id = %id, location = %location, "Terminal added");
        self.persist_terminals();
        self.events
            .publish(&RegistryEvent::TerminalAdded { id: id.clone() });
        Ok(id)
    }

    /// Kills the process, releases renderer resources and drops the
    /// instance along with any trash entry and group membership.
    pub fn remove_terminal(&self, id: &str) -> Result<(), RegistryError> {
        let (location, index, remaining, changed_groups) = {
            let mut state = self.write();
            let pos = position(&state.terminals, id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            let mut next = (*state.terminals).clone();
            let removed = next.remove(pos);
            let index = state.terminals[..pos]
                .iter()
                .filter(|t| t.location == removed.location)
                .count();
            let remaining: Vec<String> = next
                .iter()
                .filter(|t| t.location == removed.location)
                .map(|t| t.id.clone())
                .collect();

            state.terminals = Arc::new(next);
            state.trash.remove(id);
            let changed_groups = tab_groups::detach_member(&mut state, id);
            (removed.location, index, remaining, changed_groups)
        };

        warn_on_error(id, self.ports.bridge.kill(id));
        self.ports.renderer.dispose(id);

        info!(terminal_id = %id, "Terminal removed");
        self.persist_terminals();
        if !changed_groups.is_empty() {
            self.persist_tab_groups();
            for group_id in changed_groups {
                self.events
                    .publish(&RegistryEvent::TabGroupChanged { group_id });
            }
        }
        self.events.publish(&RegistryEvent::TerminalRemoved {
            id: id.to_string(),
            location,
            index,
            remaining,
        });
        Ok(())
    }

    /// Single entrypoint for inferred agent state. Unknown ids are ignored.
    pub fn update_agent_state(
        &self,
        id: &str,
        agent_state: AgentState,
        trigger: StateTrigger,
        confidence: f32,
    ) -> bool {
        let previous = {
            let mut state = self.write();
            let Some(pos) = position(&state.terminals, id) else {
                debug!(terminal_id = %id, "State update for unknown terminal ignored");
                return false;
            };
            let previous = state.terminals[pos].agent_state;
            if previous == Some(agent_state) {
                return false;
            }
            let now = self.ports.clock.now();
            let mut next = (*state.terminals).clone();
            let instance = &mut next[pos];
            instance.agent_state = Some(agent_state);
            instance.last_state_change = Some(now);
            instance.state_change_trigger = Some(trigger);
            instance.state_change_confidence = Some(confidence);
            state.terminals = Arc::new(next);
            previous
        };

        debug!(terminal_id = %id, state = %agent_state, trigger = %trigger, "Agent state updated");
        self.events.publish(&RegistryEvent::AgentStateChanged {
            id: id.to_string(),
            state: agent_state,
            previous,
        });
        true
    }

    fn update_instance<F>(&self, id: &str, apply: F) -> Result<TerminalInstance, RegistryError>
    where
        F: FnOnce(&mut TerminalInstance),
    {
        let mut state = self.write();
        let pos =
            position(&state.terminals, id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let mut next = (*state.terminals).clone();
        apply(&mut next[pos]);
        let updated = next[pos].clone();
        state.terminals = Arc::new(next);
        Ok(updated)
    }

    pub fn resize_terminal(&self, id: &str, cols: u16, rows: u16) -> Result<(), RegistryError> {
        self.update_instance(id, |t| {
            t.cols = cols;
            t.rows = rows;
        })?;
        warn_on_error(id, self.ports.bridge.resize(id, cols, rows));
        Ok(())
    }

    pub fn rename_terminal(&self, id: &str, title: impl Into<String>) -> Result<(), RegistryError> {
        let title = title.into();
        self.update_instance(id, |t| t.title = title)?;
        self.persist_terminals();
        Ok(())
    }

    pub fn update_activity(
        &self,
        id: &str,
        headline: impl Into<String>,
        status: impl Into<String>,
        kind: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let activity = Activity {
            headline: headline.into(),
            status: status.into(),
            kind: kind.into(),
            timestamp: self.ports.clock.now(),
        };
        self.update_instance(id, |t| t.activity = Some(activity))?;
        Ok(())
    }

    pub fn write_to_terminal(&self, id: &str, data: &[u8]) -> Result<(), RegistryError> {
        if self.get(id).is_none() {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.ports.bridge.write(id, data)?;
        Ok(())
    }

    /// Forget every instance and group without touching their processes.
    pub fn detach_all(&self) -> usize {
        let mut state = self.write();
        let detached = state.terminals.len();
        state.terminals = Arc::new(Vec::new());
        state.groups = Arc::new(Vec::new());
        state.trash.clear();
        debug!(detached, "Registry detached");
        detached
    }

    fn persisted_terminals(&self) -> (Option<String>, Vec<PersistedTerminal>) {
        let state = self.read();
        let terminals = state
            .terminals
            .iter()
            .filter(|t| !t.is_trashed())
            .map(PersistedTerminal::from)
            .collect();
        (state.project_id.clone(), terminals)
    }

    fn persisted_groups(&self) -> (Option<String>, Vec<PersistedTabGroup>) {
        let state = self.read();
        let groups = state.groups.iter().map(PersistedTabGroup::from).collect();
        (state.project_id.clone(), groups)
    }

    pub(crate) fn persist_terminals(&self) {
        let (project_id, terminals) = self.persisted_terminals();
        if let Err(e) = self
            .ports
            .store
            .save_terminals(project_id.as_deref(), &terminals)
        {
            warn!(error = %e, "Failed to persist terminals");
        }
    }

    pub(crate) fn persist_tab_groups(&self) {
        let (project_id, groups) = self.persisted_groups();
        if let Err(e) = self.ports.store.save_tab_groups(project_id.as_deref(), &groups) {
            warn!(error = %e, "Failed to persist tab groups");
        }
    }

    /// Persist terminals and groups, surfacing the first failure.
    pub fn persist_all(&self) -> Result<(), RegistryError> {
        let (project_id, terminals) = self.persisted_terminals();
        self.ports
            .store
            .save_terminals(project_id.as_deref(), &terminals)?;
        let (project_id, groups) = self.persisted_groups();
        self.ports
            .store
            .save_tab_groups(project_id.as_deref(), &groups)
    }
}
