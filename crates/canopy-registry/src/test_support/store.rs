use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use canopy_common::mutex_lock_or_recover;

use crate::domain::PersistedState;
use crate::domain::PersistedTabGroup;
use crate::domain::PersistedTerminal;
use crate::error::RegistryError;
use crate::ports::RenderPolicy;
use crate::ports::RendererPolicy;
use crate::ports::StateStore;

const DEFAULT_PROJECT_KEY: &str = "default";

fn key(project_id: Option<&str>) -> String {
    project_id.unwrap_or(DEFAULT_PROJECT_KEY).to_string()
}

/// In-memory store keyed by project, counting saves.
#[derive(Default)]
pub struct MockStateStore {
    states: Mutex<HashMap<String, PersistedState>>,
    terminal_saves: AtomicUsize,
    group_saves: AtomicUsize,
    loads: AtomicUsize,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
}

impl MockStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, project_id: Option<&str>, state: PersistedState) {
        mutex_lock_or_recover(&self.states).insert(key(project_id), state);
    }

    pub fn state(&self, project_id: Option<&str>) -> Option<PersistedState> {
        mutex_lock_or_recover(&self.states).get(&key(project_id)).cloned()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn terminal_saves(&self) -> usize {
        self.terminal_saves.load(Ordering::SeqCst)
    }

    pub fn group_saves(&self) -> usize {
        self.group_saves.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Terminals most recently saved for any project.
    pub fn last_terminals(&self) -> Option<Vec<PersistedTerminal>> {
        self.last_terminals_for(None)
    }

    pub fn last_terminals_for(&self, project_id: Option<&str>) -> Option<Vec<PersistedTerminal>> {
        self.state(project_id).map(|s| s.terminals)
    }

    pub fn last_groups(&self) -> Option<Vec<PersistedTabGroup>> {
        self.state(None).map(|s| s.tab_groups)
    }

    fn check_save(&self, operation: &str) -> Result<(), RegistryError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RegistryError::persistence(operation, "injected failure"));
        }
        Ok(())
    }
}

impl StateStore for MockStateStore {
    fn save_terminals(
        &self,
        project_id: Option<&str>,
        terminals: &[PersistedTerminal],
    ) -> Result<(), RegistryError> {
        self.check_save("save_terminals")?;
        self.terminal_saves.fetch_add(1, Ordering::SeqCst);
        mutex_lock_or_recover(&self.states)
            .entry(key(project_id))
            .or_default()
            .terminals = terminals.to_vec();
        Ok(())
    }

    fn save_tab_groups(
        &self,
        project_id: Option<&str>,
        groups: &[PersistedTabGroup],
    ) -> Result<(), RegistryError> {
        self.check_save("save_tab_groups")?;
        self.group_saves.fetch_add(1, Ordering::SeqCst);
        mutex_lock_or_recover(&self.states)
            .entry(key(project_id))
            .or_default()
            .tab_groups = groups.to_vec();
        Ok(())
    }

    fn load(&self, project_id: Option<&str>) -> Result<PersistedState, RegistryError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(RegistryError::persistence("load", "injected failure"));
        }
        Ok(self.state(project_id).unwrap_or_default())
    }
}

/// Records renderer hints.
#[derive(Default)]
pub struct MockRendererPolicy {
    applied: Mutex<Vec<(String, RenderPolicy)>>,
    disposed: Mutex<Vec<String>>,
}

impl MockRendererPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<(String, RenderPolicy)> {
        mutex_lock_or_recover(&self.applied).clone()
    }

    pub fn apply_count(&self) -> usize {
        mutex_lock_or_recover(&self.applied).len()
    }

    pub fn last_policy(&self, id: &str) -> Option<RenderPolicy> {
        mutex_lock_or_recover(&self.applied)
            .iter()
            .rev()
            .find(|(target, _)| target == id)
            .map(|(_, policy)| *policy)
    }

    pub fn disposed(&self) -> Vec<String> {
        mutex_lock_or_recover(&self.disposed).clone()
    }
}

impl RendererPolicy for MockRendererPolicy {
    fn apply(&self, id: &str, policy: RenderPolicy) {
        mutex_lock_or_recover(&self.applied).push((id.to_string(), policy));
    }

    fn dispose(&self, id: &str) {
        mutex_lock_or_recover(&self.disposed).push(id.to_string());
    }
}
