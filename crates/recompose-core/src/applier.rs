use std::any::Any;
use std::fmt::Write as _;

use crate::collections::map::HashMap;
use crate::{NodeError, NodeId};

/// Object-safe access to the concrete type behind a `dyn Node`.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A host tree node.
pub trait Node: AsAny {
    fn on_attach(&mut self, _parent: NodeId) {}
    fn on_detach(&mut self) {}
    /// Called once the node has left the tree for good.
    fn on_release(&mut self) {}

    /// One-line description used by tree dumps.
    fn describe(&self) -> String {
        let name = self.type_name();
        name.rsplit("::").next().unwrap_or(name).to_string()
    }
}

/// Receives the tree edits produced by a composition pass.
///
/// Every edit addresses the children of the *current* node, which starts at
/// the root and is changed with `down`/`up`. Nodes are created before any
/// edit is applied; each new node is then inserted twice, once through
/// `insert_top_down` (before its children are attached) and once through
/// `insert_bottom_up` (after). An applier honors exactly one of the two and
/// ignores the other.
///
/// `move_nodes(from, to, count)` moves `count` children starting at `from`
/// so they end up before the child that was at index `to` before the move;
/// moving forward therefore uses `to = destination + count`.
pub trait Applier {
    fn root(&self) -> NodeId;

    fn current(&self) -> NodeId;

    fn create(&mut self, id: NodeId, node: Box<dyn Node>) -> Result<(), NodeError>;

    fn down(&mut self, node: NodeId) -> Result<(), NodeError>;

    fn up(&mut self) -> Result<(), NodeError>;

    fn insert_top_down(&mut self, index: usize, node: NodeId) -> Result<(), NodeError>;

    fn insert_bottom_up(&mut self, index: usize, node: NodeId) -> Result<(), NodeError>;

    /// Removes `count` children at `index` and releases them with their
    /// descendants.
    fn remove(&mut self, index: usize, count: usize) -> Result<(), NodeError>;

    fn move_nodes(&mut self, from: usize, to: usize, count: usize) -> Result<(), NodeError>;

    /// Removes every child of the root.
    fn clear(&mut self) -> Result<(), NodeError>;

    fn node_mut(&mut self, id: NodeId) -> Result<&mut dyn Node, NodeError>;

    /// Runs a recorded property update against node `id`.
    fn update_node(&mut self, id: NodeId, update: NodeUpdate) -> Result<(), NodeError> {
        update(self.node_mut(id)?)
    }

    fn on_begin_changes(&mut self) {}

    fn on_end_changes(&mut self) {}
}

/// Deferred property update for one node, produced by `Updater`.
pub type NodeUpdate = Box<dyn FnOnce(&mut dyn Node) -> Result<(), NodeError>>;

/// Applies the `move_nodes` convention to a plain list.
pub fn move_range<T>(items: &mut Vec<T>, from: usize, to: usize, count: usize) {
    let dest = if from > to { to } else { to - count };
    let moved: Vec<T> = items.drain(from..from + count).collect();
    items.splice(dest..dest, moved);
}

/// Placeholder node at the root of a [`TreeApplier`].
#[derive(Debug, Default)]
pub struct RootNode;

impl Node for RootNode {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InsertOrder {
    #[default]
    TopDown,
    BottomUp,
}

/// Edits recorded by [`TreeApplier`], with parents resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create { node: NodeId },
    Insert { parent: NodeId, index: usize, node: NodeId },
    Remove { parent: NodeId, index: usize, count: usize },
    Move { parent: NodeId, from: usize, to: usize, count: usize },
    Clear { parent: NodeId },
    Update { node: NodeId },
}

struct NodeEntry {
    node: Box<dyn Node>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

/// In-memory applier that keeps the tree in a map and logs every edit.
pub struct TreeApplier {
    nodes: HashMap<NodeId, NodeEntry>,
    root: NodeId,
    stack: Vec<NodeId>,
    order: InsertOrder,
    operations: Vec<Operation>,
    batches: usize,
}

impl Default for TreeApplier {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeApplier {
    pub fn new() -> Self {
        Self::with_order(InsertOrder::TopDown)
    }

    pub fn with_order(order: InsertOrder) -> Self {
        let root = 0;
        let mut nodes = HashMap::default();
        nodes.insert(
            root,
            NodeEntry {
                node: Box::new(RootNode),
                children: Vec::new(),
                parent: None,
            },
        );
        Self {
            nodes,
            root,
            stack: vec![root],
            order,
            operations: Vec::new(),
            batches: 0,
        }
    }

    /// Applier that attaches nodes bottom-up, after their children.
    pub fn bottom_up() -> Self {
        Self::with_order(InsertOrder::BottomUp)
    }

    pub fn order(&self) -> InsertOrder {
        self.order
    }

    /// Number of live nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|entry| entry.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|entry| entry.parent)
    }

    pub fn node<N: Node>(&self, id: NodeId) -> Option<&N> {
        self.nodes
            .get(&id)
            .and_then(|entry| entry.node.as_any().downcast_ref::<N>())
    }

    pub fn with_node<N: Node, R>(&mut self, id: NodeId, f: impl FnOnce(&mut N) -> R) -> Result<R, NodeError> {
        let node = self.node_mut(id)?;
        let typed = node
            .as_any_mut()
            .downcast_mut::<N>()
            .ok_or(NodeError::TypeMismatch {
                id,
                expected: std::any::type_name::<N>(),
            })?;
        Ok(f(typed))
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn take_operations(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.operations)
    }

    /// Number of `on_begin_changes`/`on_end_changes` batches seen.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Indented description of the tree below the root.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for child in self.children(self.root) {
            self.dump_node(*child, 0, &mut out);
        }
        out
    }

    fn dump_node(&self, id: NodeId, depth: usize, out: &mut String) {
        if let Some(entry) = self.nodes.get(&id) {
            let _ = writeln!(out, "{:indent$}{}", "", entry.node.describe(), indent = depth * 2);
            for child in &entry.children {
                self.dump_node(*child, depth + 1, out);
            }
        }
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry, NodeError> {
        self.nodes.get_mut(&id).ok_or(NodeError::Missing { id })
    }

    fn insert(&mut self, index: usize, node: NodeId) -> Result<(), NodeError> {
        let parent = self.current();
        if !self.nodes.contains_key(&node) {
            return Err(NodeError::Missing { id: node });
        }
        let entry = self.entry_mut(parent)?;
        let len = entry.children.len();
        if index > len {
            return Err(NodeError::IndexOutOfRange { parent, index, len });
        }
        entry.children.insert(index, node);
        let child = self.entry_mut(node)?;
        child.parent = Some(parent);
        child.node.on_attach(parent);
        self.operations.push(Operation::Insert { parent, index, node });
        Ok(())
    }

    fn release(&mut self, id: NodeId) {
        if let Some(mut entry) = self.nodes.remove(&id) {
            entry.node.on_detach();
            for child in std::mem::take(&mut entry.children) {
                self.release(child);
            }
            entry.node.on_release();
        }
    }
}

impl Applier for TreeApplier {
    fn root(&self) -> NodeId {
        self.root
    }

    fn current(&self) -> NodeId {
        self.stack.last().copied().unwrap_or(self.root)
    }

    fn create(&mut self, id: NodeId, node: Box<dyn Node>) -> Result<(), NodeError> {
        if self.nodes.contains_key(&id) {
            return Err(NodeError::AlreadyExists { id });
        }
        self.nodes.insert(
            id,
            NodeEntry {
                node,
                children: Vec::new(),
                parent: None,
            },
        );
        self.operations.push(Operation::Create { node: id });
        Ok(())
    }

    fn down(&mut self, node: NodeId) -> Result<(), NodeError> {
        if !self.nodes.contains_key(&node) {
            return Err(NodeError::Missing { id: node });
        }
        self.stack.push(node);
        Ok(())
    }

    fn up(&mut self) -> Result<(), NodeError> {
        if self.stack.len() <= 1 {
            return Err(NodeError::NoCurrentNode);
        }
        self.stack.pop();
        Ok(())
    }

    fn insert_top_down(&mut self, index: usize, node: NodeId) -> Result<(), NodeError> {
        match self.order {
            InsertOrder::TopDown => self.insert(index, node),
            InsertOrder::BottomUp => Ok(()),
        }
    }

    fn insert_bottom_up(&mut self, index: usize, node: NodeId) -> Result<(), NodeError> {
        match self.order {
            InsertOrder::TopDown => Ok(()),
            InsertOrder::BottomUp => self.insert(index, node),
        }
    }

    fn remove(&mut self, index: usize, count: usize) -> Result<(), NodeError> {
        let parent = self.current();
        let entry = self.entry_mut(parent)?;
        let len = entry.children.len();
        if index + count > len {
            return Err(NodeError::IndexOutOfRange {
                parent,
                index: index + count,
                len,
            });
        }
        let removed: Vec<NodeId> = entry.children.drain(index..index + count).collect();
        for node in removed {
            self.release(node);
        }
        self.operations.push(Operation::Remove { parent, index, count });
        Ok(())
    }

    fn move_nodes(&mut self, from: usize, to: usize, count: usize) -> Result<(), NodeError> {
        let parent = self.current();
        let entry = self.entry_mut(parent)?;
        let len = entry.children.len();
        if from + count > len || to > len || (to > from && to < from + count) {
            return Err(NodeError::IndexOutOfRange {
                parent,
                index: from.max(to),
                len,
            });
        }
        move_range(&mut entry.children, from, to, count);
        self.operations.push(Operation::Move {
            parent,
            from,
            to,
            count,
        });
        Ok(())
    }

    fn clear(&mut self) -> Result<(), NodeError> {
        let root = self.root;
        let children = std::mem::take(&mut self.entry_mut(root)?.children);
        for child in children {
            self.release(child);
        }
        self.stack.truncate(1);
        self.operations.push(Operation::Clear { parent: root });
        Ok(())
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut dyn Node, NodeError> {
        self.nodes
            .get_mut(&id)
            .map(|entry| entry.node.as_mut())
            .ok_or(NodeError::Missing { id })
    }

    fn update_node(&mut self, id: NodeId, update: NodeUpdate) -> Result<(), NodeError> {
        update(self.node_mut(id)?)?;
        self.operations.push(Operation::Update { node: id });
        Ok(())
    }

    fn on_begin_changes(&mut self) {
        self.batches += 1;
    }

    fn on_end_changes(&mut self) {
        self.stack.truncate(1);
    }
}

#[cfg(test)]
#[path = "tests/applier_tests.rs"]
mod tests;
