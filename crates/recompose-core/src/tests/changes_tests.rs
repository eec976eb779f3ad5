use super::*;
use crate::applier::{move_range, TreeApplier};
use crate::Operation;

fn describe(changes: &[Change]) -> Vec<String> {
    changes.iter().map(|change| format!("{change:?}")).collect()
}

/// Replays `diff` on a plain list, honoring only the top-down inserts.
fn replay(previous: &[NodeId], diff: &ChildDiff) -> Vec<NodeId> {
    let mut list = previous.to_vec();
    for change in &diff.top {
        match change {
            Change::Remove { index, count } => {
                list.drain(*index..*index + *count);
            }
            Change::Move { from, to, count } => move_range(&mut list, *from, *to, *count),
            Change::InsertTopDown { index, node } => list.insert(*index, *node),
            _ => {}
        }
    }
    list
}

#[test]
fn identical_children_produce_no_edits() {
    let diff = diff_children(0, &[1, 2, 3], &[1, 2, 3]);
    assert!(diff.top.is_empty());
    assert!(diff.bottom.is_empty());
}

#[test]
fn rotation_is_a_single_move() {
    let diff = diff_children(0, &[1, 2, 3, 4, 5], &[2, 3, 4, 5, 1]);
    assert_eq!(describe(&diff.top), vec!["Down(0)", "Move(0, 5, 1)", "Up"]);
    assert!(diff.bottom.is_empty());
}

#[test]
fn removals_run_back_to_front() {
    let diff = diff_children(9, &[1, 2, 3, 4, 5], &[1, 4]);
    assert_eq!(
        describe(&diff.top),
        vec!["Down(9)", "Remove(4, 1)", "Remove(1, 2)", "Up"]
    );
}

#[test]
fn insertions_are_recorded_for_both_orders() {
    let diff = diff_children(0, &[1, 3], &[1, 2, 3, 4]);
    assert_eq!(
        describe(&diff.top),
        vec!["Down(0)", "InsertTopDown(1, 2)", "InsertTopDown(3, 4)", "Up"]
    );
    assert_eq!(
        describe(&diff.bottom),
        vec!["Down(0)", "InsertBottomUp(1, 2)", "InsertBottomUp(3, 4)", "Up"]
    );
}

#[test]
fn mixed_edits_reach_the_target_order() {
    let cases: [(&[NodeId], &[NodeId]); 4] = [
        (&[1, 2, 3, 4, 5], &[5, 4, 3, 2, 1]),
        (&[1, 2, 3, 4], &[4, 6, 2, 1]),
        (&[1, 2, 3], &[7, 8]),
        (&[], &[1, 2]),
    ];
    for (previous, next) in cases {
        let diff = diff_children(0, previous, next);
        assert_eq!(replay(previous, &diff), next, "{previous:?} -> {next:?}");
    }
}

#[test]
fn long_shuffles_reach_the_target_order() {
    let previous: Vec<NodeId> = (0..2_000).collect();
    // A stride permutation with every tenth node dropped and new ones mixed in.
    let next: Vec<NodeId> = (0..2_000usize)
        .map(|index| (index * 7) % 2_000)
        .filter(|node| node % 10 != 3)
        .flat_map(|node| if node % 97 == 0 { vec![node, 10_000 + node] } else { vec![node] })
        .collect();

    let diff = diff_children(0, &previous, &next);

    assert_eq!(replay(&previous, &diff), next);
}

#[test]
fn moves_in_front_of_a_moved_successor() {
    let previous = [1, 2, 3, 4, 5, 6];
    let next = [6, 5, 1, 2, 3, 4];
    let diff = diff_children(0, &previous, &next);
    assert_eq!(replay(&previous, &diff), next);
    assert_eq!(
        describe(&diff.top),
        vec!["Down(0)", "Move(4, 0, 1)", "Move(5, 0, 1)", "Up"]
    );
}

#[test]
fn reversal_keeps_one_node_in_place() {
    let diff = diff_children(0, &[1, 2, 3, 4], &[4, 3, 2, 1]);
    let moves = diff
        .top
        .iter()
        .filter(|change| matches!(change, Change::Move { .. }))
        .count();
    assert_eq!(moves, 3);
}

#[test]
fn longest_increasing_mask_marks_one_run() {
    assert_eq!(
        longest_increasing_mask(&[1, 2, 3, 4, 0]),
        vec![true, true, true, true, false]
    );
    assert_eq!(longest_increasing_mask(&[]), Vec::<bool>::new());
}

#[test]
fn apply_creates_before_editing() {
    let mut list = ChangeList::default();
    list.create(1, Box::new(|| Box::new(crate::RootNode) as Box<dyn Node>));
    list.push(Change::Down(0));
    list.push(Change::InsertTopDown { index: 0, node: 1 });
    list.push(Change::Up);
    assert_eq!(list.created().collect::<Vec<_>>(), vec![1]);

    let mut applier = TreeApplier::new();
    list.apply(&mut applier).expect("apply changes");

    assert_eq!(
        applier.operations(),
        &[
            Operation::Create { node: 1 },
            Operation::Insert {
                parent: 0,
                index: 0,
                node: 1
            },
        ]
    );
    assert_eq!(applier.batches(), 1);
}

#[test]
fn apply_stops_at_first_failing_edit() {
    let mut list = ChangeList::default();
    list.push(Change::Down(42));
    list.push(Change::Clear);

    let mut applier = TreeApplier::new();
    let error = list.apply(&mut applier).expect_err("missing node");
    assert!(matches!(error, NodeError::Missing { id: 42 }));
    assert!(applier.operations().is_empty());
}
