//! Tree edits recorded during composition and replayed against an applier.

use std::fmt;

use crate::applier::{Applier, Node, NodeUpdate};
use crate::collections::map::{HashMap, HashSet};
use crate::{NodeError, NodeId};

pub(crate) type NodeFactory = Box<dyn FnOnce() -> Box<dyn Node>>;

pub enum Change {
    Down(NodeId),
    Up,
    InsertTopDown { index: usize, node: NodeId },
    InsertBottomUp { index: usize, node: NodeId },
    Remove { index: usize, count: usize },
    Move { from: usize, to: usize, count: usize },
    Update { node: NodeId, update: NodeUpdate },
    Clear,
}

impl fmt::Debug for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Down(node) => write!(f, "Down({node})"),
            Change::Up => f.write_str("Up"),
            Change::InsertTopDown { index, node } => write!(f, "InsertTopDown({index}, {node})"),
            Change::InsertBottomUp { index, node } => write!(f, "InsertBottomUp({index}, {node})"),
            Change::Remove { index, count } => write!(f, "Remove({index}, {count})"),
            Change::Move { from, to, count } => write!(f, "Move({from}, {to}, {count})"),
            Change::Update { node, .. } => write!(f, "Update({node})"),
            Change::Clear => f.write_str("Clear"),
        }
    }
}

/// Output of one pass: nodes to create plus an ordered edit script.
#[derive(Default)]
pub struct ChangeList {
    creates: Vec<(NodeId, NodeFactory)>,
    changes: Vec<Change>,
}

impl ChangeList {
    pub(crate) fn create(&mut self, node: NodeId, factory: NodeFactory) {
        self.creates.push((node, factory));
    }

    pub(crate) fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub(crate) fn extend(&mut self, changes: impl IntoIterator<Item = Change>) {
        self.changes.extend(changes);
    }

    /// Position where a block can later be spliced in with
    /// [`splice`](Self::splice).
    pub(crate) fn mark(&self) -> usize {
        self.changes.len()
    }

    pub(crate) fn splice(&mut self, at: usize, block: Vec<Change>) {
        self.changes.splice(at..at, block);
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.changes.is_empty()
    }

    pub fn created(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.creates.iter().map(|(node, _)| *node)
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Replays the list inside one `on_begin_changes`/`on_end_changes`
    /// bracket. Creations run first.
    pub fn apply(self, applier: &mut dyn Applier) -> Result<(), NodeError> {
        log::trace!(
            "applying {} creations and {} changes",
            self.creates.len(),
            self.changes.len()
        );
        applier.on_begin_changes();
        let result = self.replay(applier);
        applier.on_end_changes();
        result
    }

    fn replay(self, applier: &mut dyn Applier) -> Result<(), NodeError> {
        for (node, factory) in self.creates {
            applier.create(node, factory())?;
        }
        for change in self.changes {
            match change {
                Change::Down(node) => applier.down(node)?,
                Change::Up => applier.up()?,
                Change::InsertTopDown { index, node } => applier.insert_top_down(index, node)?,
                Change::InsertBottomUp { index, node } => applier.insert_bottom_up(index, node)?,
                Change::Remove { index, count } => applier.remove(index, count)?,
                Change::Move { from, to, count } => applier.move_nodes(from, to, count)?,
                Change::Update { node, update } => applier.update_node(node, update)?,
                Change::Clear => applier.clear()?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ChangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeList")
            .field("creates", &self.creates.iter().map(|(node, _)| *node).collect::<Vec<_>>())
            .field("changes", &self.changes)
            .finish()
    }
}

/// Edits that turn `previous` into `next` under `parent`.
///
/// `top` holds removals, moves and top-down insertions and must run before
/// any edit inside the new children; `bottom` holds bottom-up insertions and
/// must run after them. Either is empty when there is nothing to do.
#[derive(Debug, Default)]
pub(crate) struct ChildDiff {
    pub(crate) top: Vec<Change>,
    pub(crate) bottom: Vec<Change>,
}

pub(crate) fn diff_children(parent: NodeId, previous: &[NodeId], next: &[NodeId]) -> ChildDiff {
    let mut diff = ChildDiff::default();
    if previous == next {
        return diff;
    }
    let next_set: HashSet<NodeId> = next.iter().copied().collect();
    let previous_set: HashSet<NodeId> = previous.iter().copied().collect();
    let mut edits = Vec::new();

    // Removals run back to front so earlier indices stay valid.
    let mut index = previous.len();
    while index > 0 {
        if next_set.contains(&previous[index - 1]) {
            index -= 1;
            continue;
        }
        let end = index;
        while index > 0 && !next_set.contains(&previous[index - 1]) {
            index -= 1;
        }
        edits.push(Change::Remove {
            index,
            count: end - index,
        });
    }
    let current: Vec<NodeId> = previous
        .iter()
        .copied()
        .filter(|node| next_set.contains(node))
        .collect();

    // Survivors on a longest increasing run of old positions stay put; the
    // rest are moved, back to front, in front of their new successor.
    let survivors: Vec<NodeId> = next
        .iter()
        .copied()
        .filter(|node| previous_set.contains(node))
        .collect();
    let positions: HashMap<NodeId, usize> = current
        .iter()
        .enumerate()
        .map(|(position, node)| (*node, position))
        .collect();
    let sequence: Vec<usize> = survivors.iter().map(|node| positions[node]).collect();
    let stable = longest_increasing_mask(&sequence);
    // A node that has not moved counts at its old position; a moved node
    // counts at the position of the node it was moved in front of, so every
    // current index is a prefix sum.
    let mut ranks = Fenwick::new(current.len() + 1);
    for position in 0..current.len() {
        ranks.add(position, 1);
    }
    let mut anchor = current.len();
    for k in (0..survivors.len()).rev() {
        let old = sequence[k];
        if stable[k] {
            anchor = old;
            continue;
        }
        let from = ranks.prefix(old);
        let to = ranks.prefix(anchor);
        if from + 1 == to {
            anchor = old;
            continue;
        }
        edits.push(Change::Move { from, to, count: 1 });
        ranks.add(old, -1);
        ranks.add(anchor, 1);
    }

    for (index, node) in next.iter().enumerate() {
        if !previous_set.contains(node) {
            edits.push(Change::InsertTopDown { index, node: *node });
            diff.bottom.push(Change::InsertBottomUp { index, node: *node });
        }
    }

    if !edits.is_empty() {
        diff.top.push(Change::Down(parent));
        diff.top.extend(edits);
        diff.top.push(Change::Up);
    }
    if !diff.bottom.is_empty() {
        diff.bottom.insert(0, Change::Down(parent));
        diff.bottom.push(Change::Up);
    }
    diff
}

/// Counts per position with prefix sums in O(log n).
struct Fenwick {
    tree: Vec<isize>,
}

impl Fenwick {
    fn new(len: usize) -> Self {
        Self {
            tree: vec![0; len + 1],
        }
    }

    fn add(&mut self, position: usize, delta: isize) {
        let mut index = position + 1;
        while index < self.tree.len() {
            self.tree[index] += delta;
            index += index & index.wrapping_neg();
        }
    }

    /// Sum of the counts before `end`.
    fn prefix(&self, end: usize) -> usize {
        let mut sum = 0;
        let mut index = end;
        while index > 0 {
            sum += self.tree[index];
            index &= index - 1;
        }
        sum.max(0) as usize
    }
}

/// Marks the members of one longest strictly increasing subsequence.
fn longest_increasing_mask(sequence: &[usize]) -> Vec<bool> {
    let mut tails: Vec<usize> = Vec::new();
    let mut predecessor = vec![None; sequence.len()];
    for (index, value) in sequence.iter().enumerate() {
        let slot = tails.partition_point(|tail| sequence[*tail] < *value);
        if slot > 0 {
            predecessor[index] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(index);
        } else {
            tails[slot] = index;
        }
    }
    let mut mask = vec![false; sequence.len()];
    let mut cursor = tails.last().copied();
    while let Some(index) = cursor {
        mask[index] = true;
        cursor = predecessor[index];
    }
    mask
}

#[cfg(test)]
#[path = "tests/changes_tests.rs"]
mod tests;
