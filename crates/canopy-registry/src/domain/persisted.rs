//! On-disk shapes for terminals and tab groups.

use serde::Deserialize;
use serde::Serialize;

use super::types::PanelKind;
use super::types::PanelLocation;
use super::types::TabGroup;
use super::types::TerminalInstance;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTerminal {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: PanelKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub worktree_id: Option<String>,
    #[serde(default)]
    pub location: PanelLocation,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl From<&TerminalInstance> for PersistedTerminal {
    fn from(instance: &TerminalInstance) -> Self {
        Self {
            id: instance.id.clone(),
            kind: instance.kind,
            title: instance.title.clone(),
            cwd: instance.cwd.clone(),
            worktree_id: instance.worktree_id.clone(),
            location: instance.location,
            command: instance.command.clone(),
            agent_id: instance.agent_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTabGroup {
    pub id: String,
    #[serde(default)]
    pub location: PanelLocation,
    #[serde(default)]
    pub worktree_id: Option<String>,
    #[serde(default)]
    pub active_tab_id: Option<String>,
    #[serde(default)]
    pub panel_ids: Vec<String>,
}

impl From<&TabGroup> for PersistedTabGroup {
    fn from(group: &TabGroup) -> Self {
        Self {
            id: group.id.clone(),
            location: group.location,
            worktree_id: group.worktree_id.clone(),
            active_tab_id: group.active_tab_id.clone(),
            panel_ids: group.panel_ids.clone(),
        }
    }
}

impl From<PersistedTabGroup> for TabGroup {
    fn from(group: PersistedTabGroup) -> Self {
        Self {
            id: group.id,
            location: group.location,
            worktree_id: group.worktree_id,
            active_tab_id: group.active_tab_id,
            panel_ids: group.panel_ids,
        }
    }
}

/// Everything stored for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub terminals: Vec<PersistedTerminal>,
    #[serde(default)]
    pub tab_groups: Vec<PersistedTabGroup>,
}
