//! Focused, maximized and pinged instance tracking.

use std::sync::Mutex;
use std::sync::MutexGuard;

use canopy_common::mutex_lock_or_recover;
use tracing::debug;

use crate::domain::PanelLocation;
use crate::events::RegistryEvent;

#[derive(Debug, Default)]
struct FocusState {
    focused: Option<String>,
    maximized: Option<String>,
    pinged: Option<String>,
}

#[derive(Debug, Default)]
pub struct FocusTracker {
    state: Mutex<FocusState>,
}

/// The instance now at `index`, else the one before it.
fn successor(index: usize, remaining: &[String]) -> Option<String> {
    remaining
        .get(index)
        .or_else(|| index.checked_sub(1).and_then(|i| remaining.get(i)))
        .or_else(|| remaining.last())
        .cloned()
}

impl FocusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FocusState> {
        mutex_lock_or_recover(&self.state)
    }

    pub fn focus(&self, id: Option<&str>) {
        self.state().focused = id.map(str::to_string);
    }

    pub fn focused(&self) -> Option<String> {
        self.state().focused.clone()
    }

    pub fn maximize(&self, id: Option<&str>) {
        self.state().maximized = id.map(str::to_string);
    }

    pub fn maximized(&self) -> Option<String> {
        self.state().maximized.clone()
    }

    /// Flag an instance for attention, e.g. an agent waiting on input.
    pub fn ping(&self, id: &str) {
        self.state().pinged = Some(id.to_string());
    }

    pub fn pinged(&self) -> Option<String> {
        self.state().pinged.clone()
    }

    pub fn clear_ping(&self) {
        self.state().pinged = None;
    }

    pub fn on_registry_event(&self, event: &RegistryEvent) {
        let mut state = self.state();
        match event {
            RegistryEvent::TerminalRemoved {
                id,
                index,
                remaining,
                ..
            } => {
                if state.focused.as_ref() == Some(id) {
                    state.focused = successor(*index, remaining);
                    debug!(removed = %id, next = ?state.focused, "Focus moved to successor");
                }
                if state.maximized.as_ref() == Some(id) {
                    state.maximized = None;
                }
                if state.pinged.as_ref() == Some(id) {
                    state.pinged = None;
                }
            }
            RegistryEvent::TerminalMoved { id, to, .. } if *to != PanelLocation::Grid => {
                if state.maximized.as_ref() == Some(id) {
                    state.maximized = None;
                }
                if *to == PanelLocation::Trash && state.focused.as_ref() == Some(id) {
                    state.focused = None;
                }
            }
            _ => {}
        }
    }
}
