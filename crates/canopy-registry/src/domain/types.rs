//! Registry domain types.

use canopy_core::AgentState;
use canopy_core::StateTrigger;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// What a registry entry hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PanelKind {
    #[default]
    Terminal,
    Agent,
    DevPreview,
    Browser,
    Notes,
    GitActivity,
}

/// Where an instance is placed. Persisted data without a location reads as
/// [`PanelLocation::Grid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelLocation {
    #[default]
    Grid,
    Dock,
    Trash,
}

impl PanelLocation {
    pub fn is_visible(self) -> bool {
        self == PanelLocation::Grid
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PanelLocation::Grid => "grid",
            PanelLocation::Dock => "dock",
            PanelLocation::Trash => "trash",
        }
    }
}

impl std::fmt::Display for PanelLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub headline: String,
    pub status: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalInstance {
    pub id: String,
    pub kind: PanelKind,
    pub agent_id: Option<String>,
    pub title: String,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// `None` is the global scope, not an unset value.
    pub worktree_id: Option<String>,
    pub location: PanelLocation,
    pub is_visible: bool,
    pub agent_state: Option<AgentState>,
    pub last_state_change: Option<DateTime<Utc>>,
    pub state_change_trigger: Option<StateTrigger>,
    pub state_change_confidence: Option<f32>,
    pub activity: Option<Activity>,
    /// Launch command, kept verbatim so the terminal can be respawned.
    pub command: Option<String>,
    pub pid: Option<u32>,
}

impl TerminalInstance {
    pub fn in_scope(&self, worktree_id: Option<&str>) -> bool {
        self.worktree_id.as_deref() == worktree_id
    }

    pub fn occupies_grid(&self) -> bool {
        self.location == PanelLocation::Grid
    }

    pub fn is_trashed(&self) -> bool {
        self.location == PanelLocation::Trash
    }

    /// Plain terminals have no agent state and always accept input.
    pub fn is_ready(&self) -> bool {
        self.agent_state.is_none_or(AgentState::is_ready)
    }

    pub(crate) fn place(&mut self, location: PanelLocation) {
        self.location = location;
        self.is_visible = location.is_visible();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabGroup {
    pub id: String,
    pub location: PanelLocation,
    pub worktree_id: Option<String>,
    pub active_tab_id: Option<String>,
    pub panel_ids: Vec<String>,
}

impl TabGroup {
    pub fn contains(&self, panel_id: &str) -> bool {
        self.panel_ids.iter().any(|id| id == panel_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashedTerminal {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOrigin {
    /// Interactive input; never gated.
    User,
    /// Scripted input; waits for the agent to be ready.
    Automation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub id: String,
    pub terminal_id: String,
    pub payload: String,
    pub description: String,
    pub queued_at: DateTime<Utc>,
    pub origin: CommandOrigin,
}
