use crate::domain::PersistedState;
use crate::domain::PersistedTabGroup;
use crate::domain::PersistedTerminal;
use crate::error::RegistryError;

/// Generic app-state store. `project_id` of `None` is the default project.
pub trait StateStore: Send + Sync {
    fn save_terminals(
        &self,
        project_id: Option<&str>,
        terminals: &[PersistedTerminal],
    ) -> Result<(), RegistryError>;

    fn save_tab_groups(
        &self,
        project_id: Option<&str>,
        groups: &[PersistedTabGroup],
    ) -> Result<(), RegistryError>;

    fn load(&self, project_id: Option<&str>) -> Result<PersistedState, RegistryError>;
}
