//! Grid / dock / trash transitions, worktree moves and their bulk forms.

use std::sync::Arc;

use canopy_core::AgentState;
use chrono::DateTime;
use chrono::Utc;
use tracing::debug;
use tracing::warn;

use super::TerminalRegistry;
use super::grid_count_in;
use super::position;
use super::warn_on_error;
use crate::domain::PanelLocation;
use crate::domain::TerminalInstance;
use crate::domain::TrashedTerminal;
use crate::error::RegistryError;
use crate::events::RegistryEvent;
use crate::ports::RenderPolicy;

/// One committed location change, replayed against the collaborators once
/// the state lock is released.
#[derive(Debug, Clone)]
pub(super) struct Placement {
    pub(super) id: String,
    pub(super) from: PanelLocation,
    pub(super) to: PanelLocation,
    pub(super) worktree_id: Option<String>,
}

impl Placement {
    fn of(instance: &TerminalInstance, from: PanelLocation) -> Self {
        Self {
            id: instance.id.clone(),
            from,
            to: instance.location,
            worktree_id: instance.worktree_id.clone(),
        }
    }
}

/// Absolute list index for "position `index` among terminals at `location`".
fn insertion_index(terminals: &[TerminalInstance], location: PanelLocation, index: usize) -> usize {
    let mut seen = 0;
    let mut last_match = None;
    for (i, terminal) in terminals.iter().enumerate() {
        if terminal.location == location {
            if seen == index {
                return i;
            }
            seen += 1;
            last_match = Some(i);
        }
    }
    last_match.map_or(terminals.len(), |i| i + 1)
}

impl TerminalRegistry {
    fn trash_entry(&self, id: &str) -> TrashedTerminal {
        let ttl = chrono::Duration::from_std(self.config.trash_ttl)
            .unwrap_or_else(|_| chrono::Duration::zero());
        TrashedTerminal {
            id: id.to_string(),
            expires_at: self.ports.clock.now() + ttl,
        }
    }

    pub(super) fn apply_placement_effects(&self, placement: &Placement) {
        let id = placement.id.as_str();
        if placement.from != placement.to {
            if placement.from == PanelLocation::Trash {
                warn_on_error(id, self.ports.bridge.restore(id));
            }
            match placement.to {
                PanelLocation::Grid => {
                    warn_on_error(id, self.ports.bridge.set_buffering(id, false));
                    self.ports.renderer.apply(id, RenderPolicy::Visible);
                    self.schedule_flush(id);
                }
                PanelLocation::Dock => {
                    warn_on_error(id, self.ports.bridge.set_buffering(id, true));
                    self.ports.renderer.apply(id, RenderPolicy::Background);
                }
                PanelLocation::Trash => {
                    warn_on_error(id, self.ports.bridge.set_buffering(id, true));
                    warn_on_error(id, self.ports.bridge.trash(id));
                    self.ports.renderer.apply(id, RenderPolicy::Background);
                }
            }
        }
        self.events.publish(&RegistryEvent::TerminalMoved {
            id: placement.id.clone(),
            from: placement.from,
            to: placement.to,
            worktree_id: placement.worktree_id.clone(),
        });
    }

    /// Output buffered while hidden is flushed once the renderer has had
    /// `flush_settle` to subscribe.
    fn schedule_flush(&self, id: &str) {
        let bridge = Arc::clone(&self.ports.bridge);
        let id = id.to_string();
        self.ports.scheduler.schedule(
            "flush",
            self.config.flush_settle,
            Box::new(move || {
                if let Err(e) = bridge.flush(&id) {
                    warn!(terminal_id = %id, error = %e, "Deferred flush failed");
                }
            }),
        );
    }

    /// Returns `Ok(false)` when the grid of the terminal's worktree is full;
    /// nothing changes in that case.
    fn relocate(
        &self,
        id: &str,
        target: PanelLocation,
        index: Option<usize>,
    ) -> Result<bool, RegistryError> {
        let placement = {
            let mut state = self.write();
            let pos = position(&state.terminals, id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let current = &state.terminals[pos];
            let from = current.location;
            if from == target && index.is_none() {
                return Ok(true);
            }
            if target == PanelLocation::Grid
                && from != PanelLocation::Grid
                && grid_count_in(&state.terminals, current.worktree_id.as_deref())
                    >= self.config.max_grid_terminals
            {
                debug!(terminal_id = %id, "Grid is full; move rejected");
                return Ok(false);
            }

            let mut next = (*state.terminals).clone();
            let mut instance = next.remove(pos);
            instance.place(target);
            let placement = Placement::of(&instance, from);
            let insert_at = match index {
                Some(index) => insertion_index(&next, target, index),
                None => pos,
            };
            next.insert(insert_at, instance);
            state.terminals = Arc::new(next);

            if target == PanelLocation::Trash {
                let entry = self.trash_entry(id);
                state.trash.insert(id.to_string(), entry);
            } else {
                state.trash.remove(id);
            }
            placement
        };

        self.apply_placement_effects(&placement);
        self.persist_terminals();
        Ok(true)
    }

    pub fn move_terminal_to_grid(&self, id: &str) -> Result<bool, RegistryError> {
        self.relocate(id, PanelLocation::Grid, None)
    }

    pub fn move_terminal_to_dock(&self, id: &str) -> Result<bool, RegistryError> {
        self.relocate(id, PanelLocation::Dock, None)
    }

    /// Soft delete: the terminal keeps running until its trash entry expires.
    pub fn move_terminal_to_trash(&self, id: &str) -> Result<bool, RegistryError> {
        self.relocate(id, PanelLocation::Trash, None)
    }

    /// Place `id` at `index` among the terminals at `location`.
    pub fn move_terminal_to_position(
        &self,
        id: &str,
        index: usize,
        location: PanelLocation,
    ) -> Result<bool, RegistryError> {
        if location == PanelLocation::Trash {
            return Err(RegistryError::InvalidPlacement(
                "the trash has no ordering".to_string(),
            ));
        }
        self.relocate(id, location, Some(index))
    }

    /// Back to the grid when its worktree has room, otherwise the dock.
    pub fn restore_terminal(&self, id: &str) -> Result<PanelLocation, RegistryError> {
        let trashed = self.read().trash.contains_key(id);
        if !trashed {
            return match self.get(id) {
                Some(_) => Err(RegistryError::InvalidPlacement(format!(
                    "terminal {id} is not in the trash"
                ))),
                None => Err(RegistryError::NotFound(id.to_string())),
            };
        }
        if self.relocate(id, PanelLocation::Grid, None)? {
            return Ok(PanelLocation::Grid);
        }
        self.relocate(id, PanelLocation::Dock, None)?;
        Ok(PanelLocation::Dock)
    }

    /// Hard-remove every trashed terminal whose countdown has run out.
    pub fn purge_expired_trash(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .read()
            .trash
            .values()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.id.clone())
            .collect();

        expired
            .into_iter()
            .filter(|id| match self.remove_terminal(id) {
                Ok(()) => true,
                Err(e) => {
                    warn!(terminal_id = %id, error = %e, "Failed to purge trashed terminal");
                    false
                }
            })
            .collect()
    }

    /// Grouped terminals move with their whole group. A lone terminal whose
    /// target grid is full is moved into the target's dock.
    pub fn move_terminal_to_worktree(
        &self,
        id: &str,
        target: Option<&str>,
    ) -> Result<bool, RegistryError> {
        if let Some(group) = self.group_for_panel(id) {
            return Ok(self.move_tab_group_to_worktree(&group.id, target));
        }

        let placement = {
            let mut state = self.write();
            let pos = position(&state.terminals, id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let current = &state.terminals[pos];
            if current.in_scope(target) {
                return Ok(true);
            }
            let from = current.location;
            let to = if from == PanelLocation::Grid
                && grid_count_in(&state.terminals, target) >= self.config.max_grid_terminals
            {
                debug!(terminal_id = %id, "Target grid full; terminal docked");
                PanelLocation::Dock
            } else {
                from
            };

            let mut next = (*state.terminals).clone();
            next[pos].worktree_id = target.map(str::to_string);
            next[pos].place(to);
            let placement = Placement::of(&next[pos], from);
            state.terminals = Arc::new(next);
            placement
        };

        self.apply_placement_effects(&placement);
        self.persist_terminals();
        Ok(true)
    }

    /// Move every selected terminal to `target`, up to the `limit` computed
    /// from the list under the same write lock.
    fn bulk_relocate<L, F>(&self, target: PanelLocation, limit: L, select: F) -> Vec<String>
    where
        L: FnOnce(&[TerminalInstance]) -> Option<usize>,
        F: Fn(&TerminalInstance) -> bool,
    {
        let placements: Vec<Placement> = {
            let mut state = self.write();
            let limit = limit(state.terminals.as_slice());
            if limit == Some(0) {
                return Vec::new();
            }
            let mut next = (*state.terminals).clone();
            let mut placements = Vec::new();
            for instance in next.iter_mut() {
                if limit.is_some_and(|limit| placements.len() >= limit) {
                    break;
                }
                if instance.location == target || !select(instance) {
                    continue;
                }
                let from = instance.location;
                instance.place(target);
                placements.push(Placement::of(instance, from));
            }
            if placements.is_empty() {
                return Vec::new();
            }
            state.terminals = Arc::new(next);
            for placement in &placements {
                if target == PanelLocation::Trash {
                    let entry = self.trash_entry(&placement.id);
                    state.trash.insert(placement.id.clone(), entry);
                } else {
                    state.trash.remove(&placement.id);
                }
            }
            placements
        };

        for placement in &placements {
            self.apply_placement_effects(placement);
        }
        self.persist_terminals();
        placements.into_iter().map(|p| p.id).collect()
    }

    /// Fill the scope's free grid slots with docked terminals in list order;
    /// the rest stay docked.
    pub fn bulk_move_to_grid(&self, scope: Option<&str>) -> Vec<String> {
        let max = self.config.max_grid_terminals;
        self.bulk_relocate(
            PanelLocation::Grid,
            |terminals| Some(max.saturating_sub(grid_count_in(terminals, scope))),
            |t| t.location == PanelLocation::Dock && t.in_scope(scope),
        )
    }

    pub fn bulk_move_to_dock(&self, scope: Option<&str>) -> Vec<String> {
        self.bulk_relocate(
            PanelLocation::Dock,
            |_| None,
            |t| t.occupies_grid() && t.in_scope(scope),
        )
    }

    pub fn bulk_trash(&self, scope: Option<&str>) -> Vec<String> {
        self.bulk_relocate(PanelLocation::Trash, |_| None, |t| t.in_scope(scope))
    }

    /// Remove every terminal whose agent is in one of `states`.
    pub fn bulk_close_by_state(&self, states: &[AgentState]) -> Vec<String> {
        let targets: Vec<String> = self
            .snapshot()
            .iter()
            .filter(|t| t.agent_state.is_some_and(|s| states.contains(&s)))
            .map(|t| t.id.clone())
            .collect();

        targets
            .into_iter()
            .filter(|id| self.remove_terminal(id).is_ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Clock;
    use crate::registry::AddTerminalOptions;
    use crate::test_support::TestHarness;
    use canopy_core::StateTrigger;
    use std::time::Duration;

    const WT_A: Option<&str> = Some("wt-a");
    const WT_B: Option<&str> = Some("wt-b");

    #[test]
    fn test_insertion_index_counts_within_location() {
        let h = TestHarness::new();
        h.add("g1", None);
        h.add_docked("d1", None);
        h.add("g2", None);
        let list = h.registry.snapshot();

        assert_eq!(insertion_index(&list, PanelLocation::Grid, 0), 0);
        assert_eq!(insertion_index(&list, PanelLocation::Grid, 1), 2);
        assert_eq!(insertion_index(&list, PanelLocation::Grid, 9), 3);
        assert_eq!(insertion_index(&list, PanelLocation::Trash, 0), 3);
    }

    #[test]
    fn test_grid_move_blocked_at_capacity() {
        let h = TestHarness::with_max_grid(2);
        h.add("g1", WT_A);
        h.add("g2", WT_A);
        h.add_docked("d1", WT_A);

        assert_eq!(h.registry.move_terminal_to_grid("d1"), Ok(false));
        assert_eq!(h.registry.get("d1").unwrap().location, PanelLocation::Dock);
        assert_eq!(h.registry.grid_count(WT_A), 2);
    }

    #[test]
    fn test_capacity_is_per_worktree() {
        let h = TestHarness::with_max_grid(1);
        h.add("a1", WT_A);
        h.add_docked("b1", WT_B);
        assert_eq!(h.registry.move_terminal_to_grid("b1"), Ok(true));
        assert_eq!(h.registry.grid_count(WT_B), 1);
    }

    #[test]
    fn test_dock_hints_buffering_and_grid_flushes_after_settle() {
        let h = TestHarness::new();
        h.add("t1", None);

        h.registry.move_terminal_to_dock("t1").unwrap();
        assert_eq!(h.bridge.buffering(), vec![("t1".to_string(), true)]);
        assert_eq!(h.renderer.last_policy("t1"), Some(RenderPolicy::Background));

        h.registry.move_terminal_to_grid("t1").unwrap();
        assert_eq!(h.bridge.buffering().last(), Some(&("t1".to_string(), false)));
        assert!(h.bridge.flushed().is_empty());
        assert_eq!(h.scheduler.pending(), vec![("flush", h.registry.config().flush_settle)]);

        h.scheduler.run_all();
        assert_eq!(h.bridge.flushed(), vec!["t1"]);
        assert_eq!(h.renderer.last_policy("t1"), Some(RenderPolicy::Visible));
    }

    #[test]
    fn test_trash_sets_expiry_and_restore_clears_it() {
        let h = TestHarness::new();
        h.add("t1", None);
        h.registry.move_terminal_to_trash("t1").unwrap();

        let trashed = h.registry.trashed();
        assert_eq!(trashed.len(), 1);
        assert_eq!(
            trashed[0].expires_at,
            h.clock.now() + chrono::Duration::from_std(h.registry.config().trash_ttl).unwrap()
        );
        assert_eq!(h.bridge.trashed(), vec!["t1"]);

        assert_eq!(h.registry.restore_terminal("t1"), Ok(PanelLocation::Grid));
        assert!(h.registry.trashed().is_empty());
        assert_eq!(h.bridge.restored(), vec!["t1"]);
    }

    #[test]
    fn test_restore_falls_back_to_dock_when_grid_full() {
        let h = TestHarness::with_max_grid(1);
        h.add("t1", None);
        h.registry.move_terminal_to_trash("t1").unwrap();
        h.add("t2", None);

        assert_eq!(h.registry.restore_terminal("t1"), Ok(PanelLocation::Dock));
    }

    #[test]
    fn test_restore_requires_trashed_terminal() {
        let h = TestHarness::new();
        h.add("t1", None);
        assert!(matches!(
            h.registry.restore_terminal("t1"),
            Err(RegistryError::InvalidPlacement(_))
        ));
        assert!(matches!(
            h.registry.restore_terminal("ghost"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_purge_removes_only_expired_entries() {
        let h = TestHarness::new();
        h.add("t1", None);
        h.add("t2", None);
        h.registry.move_terminal_to_trash("t1").unwrap();
        h.clock.advance(Duration::from_secs(60));
        h.registry.move_terminal_to_trash("t2").unwrap();

        let deadline = h.clock.now() + chrono::Duration::seconds(61);
        assert_eq!(h.registry.purge_expired_trash(deadline), vec!["t1"]);
        assert!(h.registry.get("t1").is_none());
        assert!(h.registry.get("t2").is_some());
    }

    #[test]
    fn test_move_to_position_reorders_within_grid() {
        let h = TestHarness::new();
        h.add("t1", None);
        h.add("t2", None);
        h.add("t3", None);

        h.registry
            .move_terminal_to_position("t3", 0, PanelLocation::Grid)
            .unwrap();
        let ids: Vec<_> = h.registry.snapshot().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["t3", "t1", "t2"]);

        assert!(h
            .registry
            .move_terminal_to_position("t1", 0, PanelLocation::Trash)
            .is_err());
    }

    #[test]
    fn test_move_to_position_into_full_grid_is_rejected() {
        let h = TestHarness::with_max_grid(1);
        h.add("t1", None);
        h.add_docked("t2", None);
        assert_eq!(
            h.registry
                .move_terminal_to_position("t2", 0, PanelLocation::Grid),
            Ok(false)
        );
    }

    #[test]
    fn test_worktree_move_to_same_scope_is_silent() {
        let h = TestHarness::new();
        h.add("t1", WT_A);
        let saves = h.store.terminal_saves();
        let applies = h.renderer.apply_count();

        assert_eq!(h.registry.move_terminal_to_worktree("t1", WT_A), Ok(true));
        assert_eq!(h.store.terminal_saves(), saves);
        assert_eq!(h.renderer.apply_count(), applies);
    }

    #[test]
    fn test_worktree_move_docks_when_target_grid_full() {
        let h = TestHarness::with_max_grid(1);
        h.add("b1", WT_B);
        h.add("a1", WT_A);

        assert_eq!(h.registry.move_terminal_to_worktree("a1", WT_B), Ok(true));
        let moved = h.registry.get("a1").unwrap();
        assert_eq!(moved.worktree_id.as_deref(), Some("wt-b"));
        assert_eq!(moved.location, PanelLocation::Dock);
        assert_eq!(h.registry.grid_count(WT_B), 1);
    }

    #[test]
    fn test_worktree_move_between_global_and_scoped() {
        let h = TestHarness::new();
        h.add("t1", None);
        assert_eq!(h.registry.move_terminal_to_worktree("t1", WT_A), Ok(true));
        assert_eq!(h.registry.grid_count(None), 0);
        assert_eq!(h.registry.grid_count(WT_A), 1);
    }

    #[test]
    fn test_bulk_move_to_grid_fills_in_order() {
        let h = TestHarness::with_max_grid(3);
        h.add("g1", WT_A);
        h.add_docked("d1", WT_A);
        h.add_docked("d2", WT_A);
        h.add_docked("d3", WT_A);
        h.add_docked("other", WT_B);

        assert_eq!(h.registry.bulk_move_to_grid(WT_A), vec!["d1", "d2"]);
        assert_eq!(h.registry.get("d3").unwrap().location, PanelLocation::Dock);
        assert_eq!(h.registry.get("other").unwrap().location, PanelLocation::Dock);
        assert!(h.registry.bulk_move_to_grid(WT_A).is_empty());
    }

    #[test]
    fn test_bulk_grid_moves_racing_adds_never_overfill() {
        let h = TestHarness::with_max_grid(4);
        for i in 0..8 {
            h.add_docked(&format!("d{i}"), WT_A);
        }
        let registry = &h.registry;

        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| registry.bulk_move_to_grid(WT_A));
            }
            for i in 0..4 {
                s.spawn(move || {
                    registry
                        .add_terminal(
                            AddTerminalOptions::default()
                                .with_id(format!("g{i}"))
                                .with_worktree(Some("wt-a".to_string())),
                        )
                        .unwrap();
                });
            }
        });

        assert_eq!(h.registry.grid_count(WT_A), 4);
        assert_eq!(h.registry.len(), 12);
    }

    #[test]
    fn test_bulk_dock_and_trash_respect_scope() {
        let h = TestHarness::new();
        h.add("a1", WT_A);
        h.add("a2", WT_A);
        h.add("b1", WT_B);

        assert_eq!(h.registry.bulk_move_to_dock(WT_A), vec!["a1", "a2"]);
        assert_eq!(h.registry.grid_count(WT_B), 1);

        assert_eq!(h.registry.bulk_trash(WT_A), vec!["a1", "a2"]);
        assert_eq!(h.registry.trashed().len(), 2);
    }

    #[test]
    fn test_bulk_close_by_state() {
        let h = TestHarness::new();
        h.add_agent("done", None);
        h.add_agent("busy", None);
        h.add("shell", None);
        h.registry
            .update_agent_state("done", AgentState::Completed, StateTrigger::Completion, 0.8);
        h.registry
            .update_agent_state("busy", AgentState::Working, StateTrigger::Busy, 0.8);

        let closed = h
            .registry
            .bulk_close_by_state(&[AgentState::Completed, AgentState::Failed]);
        assert_eq!(closed, vec!["done"]);
        assert_eq!(h.registry.len(), 2);
    }
}
