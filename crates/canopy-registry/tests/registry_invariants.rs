#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

//! Randomized operation sequences against the registry.
//!
//! After every step the grid of each worktree stays within capacity and
//! every tab group member shares its group's worktree.

use std::collections::HashSet;

use canopy_registry::AddTerminalOptions;
use canopy_registry::PanelLocation;
use canopy_registry::test_support::TestHarness;
use proptest::prelude::*;

const MAX_GRID: usize = 3;
const WORKTREES: [Option<&str>; 3] = [None, Some("wt-a"), Some("wt-b")];

#[derive(Debug, Clone)]
enum Op {
    Add { worktree: usize, docked: bool },
    ToGrid(usize),
    ToDock(usize),
    Trash(usize),
    Restore(usize),
    Remove(usize),
    ToWorktree(usize, usize),
    BulkGrid(usize),
    BulkDock(usize),
    Group(usize, usize),
    MoveGroup(usize, usize),
    Reorder(usize, usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..WORKTREES.len(), any::<bool>())
            .prop_map(|(worktree, docked)| Op::Add { worktree, docked }),
        2 => (0usize..12).prop_map(Op::ToGrid),
        1 => (0usize..12).prop_map(Op::ToDock),
        1 => (0usize..12).prop_map(Op::Trash),
        1 => (0usize..12).prop_map(Op::Restore),
        1 => (0usize..12).prop_map(Op::Remove),
        2 => (0usize..12, 0..WORKTREES.len()).prop_map(|(i, w)| Op::ToWorktree(i, w)),
        1 => (0..WORKTREES.len()).prop_map(Op::BulkGrid),
        1 => (0..WORKTREES.len()).prop_map(Op::BulkDock),
        2 => (0usize..12, 0usize..12).prop_map(|(a, b)| Op::Group(a, b)),
        1 => (0usize..4, 0..WORKTREES.len()).prop_map(|(g, w)| Op::MoveGroup(g, w)),
        1 => (0usize..12, 0usize..6).prop_map(|(i, at)| Op::Reorder(i, at)),
    ]
}

/// Id of the `index`-th live terminal, wrapping around.
fn pick(h: &TestHarness, index: usize) -> Option<String> {
    let terminals = h.registry.snapshot();
    if terminals.is_empty() {
        return None;
    }
    Some(terminals[index % terminals.len()].id.clone())
}

fn apply(h: &TestHarness, op: &Op, next_id: &mut usize) {
    match op {
        Op::Add { worktree, docked } => {
            *next_id += 1;
            let location = if *docked {
                PanelLocation::Dock
            } else {
                PanelLocation::Grid
            };
            h.registry
                .add_terminal(
                    AddTerminalOptions::default()
                        .with_id(format!("t{next_id}"))
                        .with_worktree(WORKTREES[*worktree].map(str::to_string))
                        .with_location(location),
                )
                .unwrap();
        }
        Op::ToGrid(i) => {
            if let Some(id) = pick(h, *i) {
                h.registry.move_terminal_to_grid(&id).unwrap();
            }
        }
        Op::ToDock(i) => {
            if let Some(id) = pick(h, *i) {
                h.registry.move_terminal_to_dock(&id).unwrap();
            }
        }
        Op::Trash(i) => {
            if let Some(id) = pick(h, *i) {
                h.registry.move_terminal_to_trash(&id).unwrap();
            }
        }
        Op::Restore(i) => {
            if let Some(id) = pick(h, *i) {
                let _ = h.registry.restore_terminal(&id);
            }
        }
        Op::Remove(i) => {
            if let Some(id) = pick(h, *i) {
                h.registry.remove_terminal(&id).unwrap();
            }
        }
        Op::ToWorktree(i, w) => {
            if let Some(id) = pick(h, *i) {
                h.registry.move_terminal_to_worktree(&id, WORKTREES[*w]).unwrap();
            }
        }
        Op::BulkGrid(w) => {
            h.registry.bulk_move_to_grid(WORKTREES[*w]);
        }
        Op::BulkDock(w) => {
            h.registry.bulk_move_to_dock(WORKTREES[*w]);
        }
        Op::Group(a, b) => {
            if let (Some(a), Some(b)) = (pick(h, *a), pick(h, *b)) {
                h.registry.create_tab_group(PanelLocation::Grid, &[a, b]);
            }
        }
        Op::MoveGroup(g, w) => {
            let groups = h.registry.tab_groups();
            if !groups.is_empty() {
                let group_id = groups[g % groups.len()].id.clone();
                h.registry.move_tab_group_to_worktree(&group_id, WORKTREES[*w]);
            }
        }
        Op::Reorder(i, at) => {
            if let Some(id) = pick(h, *i) {
                let _ = h
                    .registry
                    .move_terminal_to_position(&id, *at, PanelLocation::Grid);
            }
        }
    }
}

fn check_invariants(h: &TestHarness) -> Result<(), TestCaseError> {
    for scope in WORKTREES {
        prop_assert!(
            h.registry.grid_count(scope) <= MAX_GRID,
            "grid for {:?} holds {}",
            scope,
            h.registry.grid_count(scope)
        );
    }

    let mut claimed = HashSet::new();
    for group in h.registry.tab_groups().iter() {
        prop_assert!(group.panel_ids.len() >= 2, "group {} too small", group.id);
        for panel_id in &group.panel_ids {
            prop_assert!(claimed.insert(panel_id.clone()), "{} in two groups", panel_id);
            let member = h.registry.get(panel_id);
            prop_assert!(member.is_some(), "group {} holds unknown {}", group.id, panel_id);
            prop_assert_eq!(&member.unwrap().worktree_id, &group.worktree_id);
        }
    }

    let trashed: HashSet<String> = h.registry.trashed().into_iter().map(|t| t.id).collect();
    for terminal in h.registry.snapshot().iter() {
        prop_assert_eq!(terminal.is_trashed(), trashed.contains(&terminal.id));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_across_operation_sequences(ops in prop::collection::vec(arb_op(), 1..60)) {
        let h = TestHarness::with_max_grid(MAX_GRID);
        let mut next_id = 0;
        for op in &ops {
            apply(&h, op, &mut next_id);
            check_invariants(&h)?;
        }
    }

    #[test]
    fn adding_never_overfills_a_grid(count in 1usize..12, worktree in 0..WORKTREES.len()) {
        let h = TestHarness::with_max_grid(MAX_GRID);
        for i in 0..count {
            h.add(&format!("t{i}"), WORKTREES[worktree]);
        }
        prop_assert_eq!(h.registry.grid_count(WORKTREES[worktree]), count.min(MAX_GRID));
        prop_assert_eq!(h.registry.len(), count);
    }
}
