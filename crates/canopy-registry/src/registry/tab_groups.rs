//! Tab groups: instances sharing one tab strip.
//!
//! Every member of a group has the group's worktree scope. Operations that
//! would break that are refused without mutating anything.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use super::RegistryState;
use super::TerminalRegistry;
use super::grid_count_in;
use super::placement::Placement;
use super::position;
use crate::domain::PanelLocation;
use crate::domain::PersistedTabGroup;
use crate::domain::TabGroup;
use crate::events::RegistryEvent;
use crate::ports::RenderPolicy;

/// Drop `panel_id` from whichever group holds it, dissolving groups left
/// with a single member. Returns the ids of the groups that changed.
pub(super) fn detach_member(state: &mut RegistryState, panel_id: &str) -> Vec<String> {
    if !state.groups.iter().any(|g| g.contains(panel_id)) {
        return Vec::new();
    }
    let mut changed = Vec::new();
    let mut next = Vec::with_capacity(state.groups.len());
    for group in state.groups.iter() {
        if !group.contains(panel_id) {
            next.push(group.clone());
            continue;
        }
        changed.push(group.id.clone());
        let mut group = group.clone();
        group.panel_ids.retain(|id| id != panel_id);
        if group.panel_ids.len() <= 1 {
            debug!(group_id = %group.id, "Tab group dissolved");
            continue;
        }
        fix_active_tab(&mut group);
        next.push(group);
    }
    state.groups = Arc::new(next);
    changed
}

fn fix_active_tab(group: &mut TabGroup) {
    let valid = group
        .active_tab_id
        .as_ref()
        .is_some_and(|active| group.contains(active));
    if !valid {
        group.active_tab_id = group.panel_ids.first().cloned();
    }
}

/// Most common worktree among `scopes`; ties go to the one seen first.
fn majority_scope(scopes: &[Option<String>]) -> Option<String> {
    let mut counts: HashMap<&Option<String>, usize> = HashMap::new();
    for scope in scopes {
        *counts.entry(scope).or_default() += 1;
    }
    let mut best: Option<(&Option<String>, usize)> = None;
    for scope in scopes {
        let count = counts.get(scope).copied().unwrap_or(0);
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((scope, count));
        }
    }
    best.and_then(|(scope, _)| scope.clone())
}

impl TerminalRegistry {
    pub fn tab_groups(&self) -> Arc<Vec<TabGroup>> {
        Arc::clone(&self.read().groups)
    }

    pub fn tab_group(&self, group_id: &str) -> Option<TabGroup> {
        self.read().groups.iter().find(|g| g.id == group_id).cloned()
    }

    pub fn group_for_panel(&self, panel_id: &str) -> Option<TabGroup> {
        self.read()
            .groups
            .iter()
            .find(|g| g.contains(panel_id))
            .cloned()
    }

    fn publish_group_changed(&self, group_id: &str) {
        self.events.publish(&RegistryEvent::TabGroupChanged {
            group_id: group_id.to_string(),
        });
    }

    /// Group two or more live, ungrouped panels that share a worktree scope.
    /// Returns `None` and changes nothing otherwise.
    pub fn create_tab_group(&self, location: PanelLocation, panel_ids: &[String]) -> Option<String> {
        if location == PanelLocation::Trash {
            return None;
        }
        let mut members: Vec<String> = Vec::with_capacity(panel_ids.len());
        for id in panel_ids {
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        if members.len() < 2 {
            return None;
        }

        let group_id = {
            let mut state = self.write();
            let mut scope: Option<Option<String>> = None;
            for id in &members {
                let instance = state.terminals.iter().find(|t| &t.id == id)?;
                if instance.is_trashed() || state.groups.iter().any(|g| g.contains(id)) {
                    return None;
                }
                match &scope {
                    None => scope = Some(instance.worktree_id.clone()),
                    Some(expected) if *expected != instance.worktree_id => {
                        debug!(panel_id = %id, "Tab group members span worktrees");
                        return None;
                    }
                    Some(_) => {}
                }
            }

            let group = TabGroup {
                id: Uuid::new_v4().to_string(),
                location,
                worktree_id: scope.flatten(),
                active_tab_id: members.first().cloned(),
                panel_ids: members,
            };
            let group_id = group.id.clone();
            let mut next = (*state.groups).clone();
            next.push(group);
            state.groups = Arc::new(next);
            group_id
        };

        info!(group_id = %group_id, "Tab group created");
        self.persist_tab_groups();
        self.publish_group_changed(&group_id);
        Some(group_id)
    }

    /// A panel from another worktree scope is refused. A panel already in a
    /// different group leaves that group first.
    pub fn add_panel_to_group(&self, group_id: &str, panel_id: &str) -> bool {
        let changed = {
            let mut state = self.write();
            let Some(group) = state.groups.iter().find(|g| g.id == group_id) else {
                return false;
            };
            if group.contains(panel_id) {
                return true;
            }
            let Some(instance) = state.terminals.iter().find(|t| t.id == panel_id) else {
                return false;
            };
            if instance.is_trashed() || instance.worktree_id != group.worktree_id {
                debug!(group_id, panel_id, "Panel rejected by tab group");
                return false;
            }

            let mut changed = detach_member(&mut state, panel_id);
            let Some(pos) = state.groups.iter().position(|g| g.id == group_id) else {
                return false;
            };
            let mut next = (*state.groups).clone();
            next[pos].panel_ids.push(panel_id.to_string());
            state.groups = Arc::new(next);
            changed.push(group_id.to_string());
            changed
        };

        self.persist_tab_groups();
        for id in changed {
            self.publish_group_changed(&id);
        }
        true
    }

    pub fn remove_panel_from_group(&self, group_id: &str, panel_id: &str) -> bool {
        {
            let mut state = self.write();
            if !state
                .groups
                .iter()
                .any(|g| g.id == group_id && g.contains(panel_id))
            {
                return false;
            }
            detach_member(&mut state, panel_id);
        }
        self.persist_tab_groups();
        self.publish_group_changed(group_id);
        true
    }

    pub fn set_active_tab(&self, group_id: &str, panel_id: &str) -> bool {
        {
            let mut state = self.write();
            let Some(pos) = state
                .groups
                .iter()
                .position(|g| g.id == group_id && g.contains(panel_id))
            else {
                return false;
            };
            let mut next = (*state.groups).clone();
            next[pos].active_tab_id = Some(panel_id.to_string());
            state.groups = Arc::new(next);
        }
        self.persist_tab_groups();
        self.publish_group_changed(group_id);
        true
    }

    /// All-or-nothing: when the target scope lacks grid room for every
    /// grid-resident member, nothing changes and `false` is returned.
    pub fn move_tab_group_to_worktree(&self, group_id: &str, target: Option<&str>) -> bool {
        let moved = {
            let mut state = self.write();
            let Some(gpos) = state.groups.iter().position(|g| g.id == group_id) else {
                return false;
            };
            let group = &state.groups[gpos];
            if group.worktree_id.as_deref() == target {
                return true;
            }

            let members: Vec<usize> = group
                .panel_ids
                .iter()
                .filter_map(|id| position(&state.terminals, id))
                .collect();
            let required = members
                .iter()
                .filter(|&&pos| state.terminals[pos].occupies_grid())
                .count();
            let available = self
                .config
                .max_grid_terminals
                .saturating_sub(grid_count_in(&state.terminals, target));
            if required > available {
                warn!(
                    group_id,
                    target = target.unwrap_or("global"),
                    required,
                    available,
                    "Not enough grid capacity to move tab group"
                );
                return false;
            }

            let mut terminals = (*state.terminals).clone();
            let mut moved = Vec::with_capacity(members.len());
            for pos in members {
                terminals[pos].worktree_id = target.map(str::to_string);
                moved.push(Placement {
                    id: terminals[pos].id.clone(),
                    from: terminals[pos].location,
                    to: terminals[pos].location,
                    worktree_id: terminals[pos].worktree_id.clone(),
                });
            }
            let mut groups = (*state.groups).clone();
            groups[gpos].worktree_id = target.map(str::to_string);
            state.terminals = Arc::new(terminals);
            state.groups = Arc::new(groups);
            moved
        };

        for placement in &moved {
            if placement.to != PanelLocation::Trash {
                self.ports.renderer.apply(&placement.id, RenderPolicy::Visible);
            }
            self.apply_placement_effects(placement);
        }
        self.persist_terminals();
        self.persist_tab_groups();
        self.publish_group_changed(group_id);
        info!(group_id, members = moved.len(), "Tab group moved to worktree");
        true
    }

    /// Install persisted groups, repairing what no longer holds: unknown and
    /// trashed members are dropped, groups left with one member dissolve, and
    /// groups whose members disagree on worktree are normalized to the
    /// majority worktree. Returns the number of groups that needed repair.
    pub fn hydrate_tab_groups(&self, persisted: Vec<PersistedTabGroup>) -> usize {
        let (repaired, placements) = {
            let mut state = self.write();
            let mut terminals = (*state.terminals).clone();
            let mut groups: Vec<TabGroup> = Vec::with_capacity(persisted.len());
            let mut claimed: HashSet<String> = HashSet::new();
            let mut placements = Vec::new();
            let mut repaired = 0;

            for persisted_group in persisted {
                let mut group: TabGroup = persisted_group.into();
                let original = group.clone();
                group.panel_ids.retain(|id| {
                    position(&terminals, id).is_some_and(|pos| !terminals[pos].is_trashed())
                        && claimed.insert(id.clone())
                });
                if group.panel_ids.len() <= 1 {
                    for id in &group.panel_ids {
                        claimed.remove(id);
                    }
                    debug!(group_id = %group.id, "Persisted tab group dissolved");
                    repaired += 1;
                    continue;
                }

                let scopes: Vec<Option<String>> = group
                    .panel_ids
                    .iter()
                    .filter_map(|id| position(&terminals, id))
                    .map(|pos| terminals[pos].worktree_id.clone())
                    .collect();
                let scope = majority_scope(&scopes);
                group.worktree_id = scope.clone();
                for id in &group.panel_ids {
                    let Some(pos) = position(&terminals, id) else {
                        continue;
                    };
                    if terminals[pos].worktree_id == scope {
                        continue;
                    }
                    let from = terminals[pos].location;
                    terminals[pos].worktree_id = scope.clone();
                    if from == PanelLocation::Grid
                        && grid_count_in(&terminals, scope.as_deref())
                            > self.config.max_grid_terminals
                    {
                        terminals[pos].place(PanelLocation::Dock);
                    }
                    placements.push(Placement {
                        id: id.clone(),
                        from,
                        to: terminals[pos].location,
                        worktree_id: scope.clone(),
                    });
                }
                fix_active_tab(&mut group);
                if group != original {
                    info!(group_id = %group.id, "Repaired persisted tab group");
                    repaired += 1;
                }
                groups.push(group);
            }

            state.terminals = Arc::new(terminals);
            state.groups = Arc::new(groups);
            (repaired, placements)
        };

        for placement in &placements {
            self.apply_placement_effects(placement);
        }
        if repaired > 0 {
            self.persist_terminals();
            self.persist_tab_groups();
        }
        repaired
    }
}
