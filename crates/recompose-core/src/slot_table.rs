//! Group-structured storage for composition output.
//!
//! A [`SlotTable`] is a pre-order flattened tree of groups. Each record stores
//! the size of its subtree so a reader can step over a whole group in O(1).
//!
//! The groups live in a gap buffer: `front` holds the groups before the gap
//! in table order and `back` holds the groups after it, last group first.
//! Inserting or removing at the gap never touches the groups on either side.
//!
//! A pass never mutates the table it reads. Its [`SlotWriter`] records the
//! successor as runs of old groups kept in place plus the groups it wrote;
//! [`PendingTable::commit`] then edits the installed table in place, moving
//! the gap to the first group that changed position. Groups ahead of that
//! point and behind the last changed position are left where they are.
//!
//! Anchors are shared cells whose position is only rewritten at commit, so
//! every anchor always refers to the table currently installed in the
//! composition. An anchor after the gap stores its distance from the end of
//! the table, which insertions at the gap do not change.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::remember::RememberObserver;
use crate::scope::RecomposeScope;
use crate::{Key, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Position {
    Detached,
    /// Index of a group before the gap.
    Start(usize),
    /// Distance of a group after the gap from the last group.
    End(usize),
}

struct AnchorCell {
    position: Cell<Position>,
    /// Length of the table the anchor was placed in.
    extent: RefCell<Option<Rc<Cell<usize>>>>,
}

/// Stable reference to a group that survives moves of the group.
#[derive(Clone)]
pub struct Anchor {
    cell: Rc<AnchorCell>,
}

impl Anchor {
    pub(crate) fn new() -> Self {
        Self {
            cell: Rc::new(AnchorCell {
                position: Cell::new(Position::Detached),
                extent: RefCell::new(None),
            }),
        }
    }

    /// Index of the anchored group in the committed table, or `None` when the
    /// group has been removed or not committed yet.
    pub fn location(&self) -> Option<usize> {
        match self.cell.position.get() {
            Position::Detached => None,
            Position::Start(index) => Some(index),
            Position::End(from_end) => {
                let extent = self.cell.extent.borrow();
                extent.as_ref()?.get().checked_sub(from_end + 1)
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cell.position.get() != Position::Detached
    }

    pub(crate) fn set_location(&self, location: usize) {
        self.cell.position.set(Position::Start(location));
    }

    fn place(&self, position: Position, extent: &Rc<Cell<usize>>) {
        self.cell.position.set(position);
        let mut current = self.cell.extent.borrow_mut();
        if !current.as_ref().is_some_and(|current| Rc::ptr_eq(current, extent)) {
            *current = Some(Rc::clone(extent));
        }
    }

    pub(crate) fn invalidate(&self) {
        self.cell.position.set(Position::Detached);
    }

    pub fn ptr_eq(&self, other: &Anchor) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location() {
            Some(location) => write!(f, "Anchor({location})"),
            None => f.write_str("Anchor(invalid)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Root,
    Replaceable,
    Restartable,
    Movable,
    Reusable,
    Node,
}

/// A remembered value stored in a group.
#[derive(Clone)]
pub enum SlotValue {
    Value(Rc<dyn Any>),
    /// A value that wants lifecycle callbacks when it enters or leaves the
    /// composition.
    Observed {
        value: Rc<dyn Any>,
        observer: Rc<dyn RememberObserver>,
    },
}

impl SlotValue {
    pub fn value(&self) -> &Rc<dyn Any> {
        match self {
            SlotValue::Value(value) => value,
            SlotValue::Observed { value, .. } => value,
        }
    }

    pub fn observer(&self) -> Option<&Rc<dyn RememberObserver>> {
        match self {
            SlotValue::Value(_) => None,
            SlotValue::Observed { observer, .. } => Some(observer),
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        (**self.value()).downcast_ref::<T>()
    }
}

impl fmt::Debug for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotValue::Value(_) => f.write_str("Value"),
            SlotValue::Observed { .. } => f.write_str("Observed"),
        }
    }
}

/// A slot plus the number of child groups that preceded it in its group.
///
/// The ordinal lets a traversal interleave slots and child groups in the
/// order they were originally produced.
#[derive(Clone, Debug)]
pub(crate) struct Slot {
    pub(crate) value: SlotValue,
    pub(crate) after_children: u32,
}

/// Position of a slot in the order slots were written.
///
/// `boundary` is the first group index that follows the slot in a pre-order
/// walk that interleaves slots with child groups. Slots sharing a boundary
/// were written innermost group first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotOrder {
    boundary: usize,
    group: Reverse<usize>,
    ordinal: usize,
}

impl SlotOrder {
    fn new(boundary: usize, group: usize, ordinal: usize) -> Self {
        Self {
            boundary,
            group: Reverse(group),
            ordinal,
        }
    }
}

#[derive(Clone)]
pub struct GroupRecord {
    pub(crate) key: Key,
    pub(crate) data_key: Option<Key>,
    pub(crate) kind: GroupKind,
    pub(crate) size: usize,
    pub(crate) node_count: usize,
    pub(crate) node: Option<NodeId>,
    pub(crate) slots: SmallVec<[Slot; 2]>,
    pub(crate) anchor: Option<Anchor>,
    pub(crate) scope: Option<RecomposeScope>,
}

impl GroupRecord {
    pub fn key(&self) -> Key {
        self.key
    }

    pub fn data_key(&self) -> Option<Key> {
        self.data_key
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Number of groups in this subtree, the group itself included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of nodes this group contributes to its nearest node ancestor.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&SlotValue> {
        self.slots.get(index).map(|slot| &slot.value)
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        self.anchor.as_ref()
    }

    pub fn scope(&self) -> Option<&RecomposeScope> {
        self.scope.as_ref()
    }
}

impl fmt::Debug for GroupRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRecord")
            .field("key", &format_args!("{:#x}", self.key))
            .field("data_key", &self.data_key)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("node", &self.node)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Header fields for a group about to be written.
#[derive(Clone)]
pub(crate) struct GroupHeader {
    pub(crate) key: Key,
    pub(crate) data_key: Option<Key>,
    pub(crate) kind: GroupKind,
    pub(crate) node: Option<NodeId>,
    pub(crate) anchor: Option<Anchor>,
    pub(crate) scope: Option<RecomposeScope>,
    /// Old-table index of the group this one rewrites.
    pub(crate) origin: Option<usize>,
}

impl GroupHeader {
    pub(crate) fn new(kind: GroupKind, key: Key, data_key: Option<Key>) -> Self {
        Self {
            key,
            data_key,
            kind,
            node: None,
            anchor: None,
            scope: None,
            origin: None,
        }
    }

    /// Header of the old group at `index`, rewritten in its place.
    pub(crate) fn of(reader: &SlotReader, index: usize) -> Self {
        let record = reader.group(index);
        Self {
            key: record.key,
            data_key: record.data_key,
            kind: record.kind,
            node: record.node,
            anchor: record.anchor.clone(),
            scope: record.scope.clone(),
            origin: Some(index),
        }
    }
}

#[derive(Default)]
pub struct SlotTable {
    front: Vec<GroupRecord>,
    back: Vec<GroupRecord>,
    extent: Rc<Cell<usize>>,
    writing: Cell<bool>,
    readers: Cell<usize>,
}

impl Clone for SlotTable {
    /// Copies the groups. The copy shares the length cell its anchors resolve
    /// against, so it can replace the original as the installed table.
    fn clone(&self) -> Self {
        Self {
            front: self.front.clone(),
            back: self.back.clone(),
            extent: Rc::clone(&self.extent),
            writing: Cell::new(false),
            readers: Cell::new(0),
        }
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_count(&self) -> usize {
        self.front.len() + self.back.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group_count() == 0
    }

    /// Index of the first group after the gap.
    pub fn gap(&self) -> usize {
        self.front.len()
    }

    pub fn group(&self, index: usize) -> Option<&GroupRecord> {
        if index < self.front.len() {
            return self.front.get(index);
        }
        let from_end = self.group_count().checked_sub(index + 1)?;
        self.back.get(from_end)
    }

    /// Groups in table order.
    pub fn groups(&self) -> impl Iterator<Item = &GroupRecord> + '_ {
        self.front.iter().chain(self.back.iter().rev())
    }

    pub fn is_writing(&self) -> bool {
        self.writing.get()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.get()
    }

    pub fn open_reader(self: &Rc<Self>) -> SlotReader {
        self.readers.set(self.readers.get() + 1);
        SlotReader {
            table: Rc::clone(self),
            closed: false,
        }
    }

    /// Opens the single writer that records this table's successor.
    ///
    /// # Panics
    /// Panics if a writer for this table is already open.
    pub fn open_writer(self: &Rc<Self>) -> SlotWriter {
        assert!(
            !self.writing.get(),
            "slot table already has an active writer"
        );
        self.writing.set(true);
        SlotWriter {
            source: Rc::clone(self),
            entries: Vec::new(),
            open: Vec::new(),
            written: 0,
            removed_anchors: Vec::new(),
        }
    }

    /// Every anchor in the table, paired with its group index.
    pub fn anchors(&self) -> impl Iterator<Item = (usize, &Anchor)> + '_ {
        self.groups()
            .enumerate()
            .filter_map(|(index, record)| record.anchor.as_ref().map(|anchor| (index, anchor)))
    }

    /// Checks group nesting, node counts and anchor locations.
    pub fn verify(&self) -> Result<(), String> {
        let count = self.group_count();
        if self.extent.get() != count {
            return Err(format!(
                "table holds {count} groups but anchors resolve against {}",
                self.extent.get()
            ));
        }
        let mut index = 0;
        while index < count {
            index = self.verify_group(index, count)?;
        }
        for (index, anchor) in self.anchors() {
            if anchor.location() != Some(index) {
                return Err(format!(
                    "anchor of group {index} points at {:?}",
                    anchor.location()
                ));
            }
        }
        Ok(())
    }

    fn verify_group(&self, index: usize, parent_end: usize) -> Result<usize, String> {
        let record = self
            .group(index)
            .ok_or_else(|| format!("group {index} is missing"))?;
        let end = index + record.size;
        if record.size == 0 || end > parent_end {
            return Err(format!(
                "group {index} of size {} overflows parent end {parent_end}",
                record.size
            ));
        }
        let mut child = index + 1;
        let mut nodes = 0;
        let mut ordinal = 0u32;
        while child < end {
            nodes += self.group(child).map_or(0, |child| child.node_count);
            child = self.verify_group(child, end)?;
            ordinal += 1;
        }
        if record.slots.iter().any(|slot| slot.after_children > ordinal) {
            return Err(format!("group {index} has a slot past its last child"));
        }
        let expected = if record.kind == GroupKind::Node { 1 } else { nodes };
        if record.node_count != expected {
            return Err(format!(
                "group {index} reports {} nodes, found {expected}",
                record.node_count
            ));
        }
        if (record.kind == GroupKind::Node) != record.node.is_some() {
            return Err(format!("group {index} node flag disagrees with kind"));
        }
        Ok(end)
    }

    /// Moves the gap so that `index` is the first group after it. Anchors of
    /// the groups crossing the gap switch encoding.
    fn move_gap(&mut self, index: usize) {
        while self.front.len() > index {
            let Some(record) = self.front.pop() else { break };
            if let Some(anchor) = &record.anchor {
                anchor.place(Position::End(self.back.len()), &self.extent);
            }
            self.back.push(record);
        }
        while self.front.len() < index {
            let Some(record) = self.back.pop() else { break };
            if let Some(anchor) = &record.anchor {
                anchor.place(Position::Start(self.front.len()), &self.extent);
            }
            self.front.push(record);
        }
    }

    /// Inserts `record` at the gap.
    fn push_at_gap(&mut self, record: GroupRecord) {
        if let Some(anchor) = &record.anchor {
            anchor.place(Position::Start(self.front.len()), &self.extent);
        }
        self.front.push(record);
    }

    /// Overwrites the group at `index` without moving anything else.
    fn replace(&mut self, index: usize, record: GroupRecord) {
        let (slot, position) = if index < self.front.len() {
            (&mut self.front[index], Position::Start(index))
        } else {
            let from_end = self.group_count() - 1 - index;
            (&mut self.back[from_end], Position::End(from_end))
        };
        if let Some(anchor) = &record.anchor {
            anchor.place(position, &self.extent);
        }
        *slot = record;
    }
}

impl SlotTable {
    /// One indented line per group, in table order.
    pub fn groups_debug(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.group_count());
        let mut depth_ends: Vec<usize> = Vec::new();
        for (index, record) in self.groups().enumerate() {
            while depth_ends.last().is_some_and(|end| *end <= index) {
                depth_ends.pop();
            }
            lines.push(format!(
                "{:indent$}[{index}] {:?} key={:#x} size={} slots={}{}",
                "",
                record.kind,
                record.key,
                record.size,
                record.slots.len(),
                record
                    .node
                    .map(|node| format!(" node={node}"))
                    .unwrap_or_default(),
                indent = depth_ends.len() * 2
            ));
            depth_ends.push(index + record.size);
        }
        lines
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SlotTable({} groups, gap at {})", self.group_count(), self.gap())?;
        for line in self.groups_debug() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Cursor over an immutable table snapshot.
pub struct SlotReader {
    table: Rc<SlotTable>,
    closed: bool,
}

impl SlotReader {
    pub fn table(&self) -> &Rc<SlotTable> {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.check_open();
        self.table.group_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Panics
    /// Panics if the reader was closed or `index` is out of range.
    pub fn group(&self, index: usize) -> &GroupRecord {
        self.check_open();
        match self.table.group(index) {
            Some(record) => record,
            None => panic!("group {index} is outside a table of {}", self.table.group_count()),
        }
    }

    /// Index one past the last descendant of `index`.
    pub fn group_end(&self, index: usize) -> usize {
        index + self.group(index).size
    }

    /// Steps over the group at `index`, returning the index of its next
    /// sibling.
    pub fn skip(&self, index: usize) -> usize {
        self.group_end(index)
    }

    /// Direct children of the group at `index`.
    pub fn children(&self, index: usize) -> Children<'_> {
        let end = self.group_end(index);
        Children {
            reader: self,
            next: index + 1,
            end,
        }
    }

    /// True when `location` lies inside the subtree rooted at `index`.
    pub fn contains(&self, index: usize, location: usize) -> bool {
        location >= index && location < self.group_end(index)
    }

    /// Appends the nodes the group at `index` contributes to its parent node.
    pub fn collect_nodes(&self, index: usize, out: &mut Vec<NodeId>) {
        let record = self.group(index);
        if record.node_count == 0 {
            return;
        }
        if let Some(node) = record.node {
            out.push(node);
            return;
        }
        for child in self.children(index) {
            self.collect_nodes(child, out);
        }
    }

    /// Nodes directly owned by the group at `index` (the children of the
    /// node it emits, when it is a node group).
    pub fn collect_child_nodes(&self, index: usize, out: &mut Vec<NodeId>) {
        for child in self.children(index) {
            self.collect_nodes(child, out);
        }
    }

    /// Visits every slot of the subtree in the order the slots were written,
    /// interleaving parents' slots around their children.
    pub fn visit_slots(&self, index: usize, visit: &mut dyn FnMut(SlotOrder, &SlotValue)) {
        let record = self.group(index);
        let mut slots = record.slots.iter().enumerate().peekable();
        let mut ordinal = 0u32;
        let mut boundary = index + 1;
        for child in self.children(index) {
            while let Some((at, slot)) = slots.next_if(|(_, slot)| slot.after_children <= ordinal) {
                visit(SlotOrder::new(boundary, index, at), &slot.value);
            }
            self.visit_slots(child, visit);
            boundary = self.group_end(child);
            ordinal += 1;
        }
        for (at, slot) in slots {
            visit(SlotOrder::new(boundary, index, at), &slot.value);
        }
    }

    /// Write order of slot `ordinal` of the group at `index`.
    pub fn slot_order(&self, index: usize, ordinal: usize) -> SlotOrder {
        let after = self
            .group(index)
            .slots
            .get(ordinal)
            .map_or(0, |slot| slot.after_children as usize);
        let boundary = match after.checked_sub(1) {
            Some(last) => self
                .children(index)
                .nth(last)
                .map_or(index + 1, |child| self.group_end(child)),
            None => index + 1,
        };
        SlotOrder::new(boundary, index, ordinal)
    }

    /// Visits every group in the subtree in pre-order, the root included.
    pub fn visit_groups(&self, index: usize, visit: &mut dyn FnMut(usize, &GroupRecord)) {
        let end = self.group_end(index);
        for location in index..end {
            visit(location, self.group(location));
        }
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.table.readers.set(self.table.readers.get() - 1);
        }
    }

    fn check_open(&self) {
        assert!(!self.closed, "slot reader used after close");
    }
}

impl Drop for SlotReader {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct Children<'a> {
    reader: &'a SlotReader,
    next: usize,
    end: usize,
}

impl Iterator for Children<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next >= self.end {
            return None;
        }
        let current = self.next;
        self.next = self.reader.skip(current);
        Some(current)
    }
}

/// One step of the successor table, in pre-order.
enum Entry {
    /// Old groups `start..start + len` carried over untouched.
    Kept { start: usize, len: usize },
    /// A group written by the pass. `origin` is the old group it replaces.
    Written {
        record: GroupRecord,
        origin: Option<usize>,
    },
}

impl Entry {
    fn origin(&self) -> Option<usize> {
        match self {
            Entry::Kept { start, .. } => Some(*start),
            Entry::Written { origin, .. } => *origin,
        }
    }

    fn span(&self) -> usize {
        match self {
            Entry::Kept { len, .. } => *len,
            Entry::Written { .. } => 1,
        }
    }
}

struct OpenGroup {
    entry: usize,
    index: usize,
    children: u32,
    nodes: usize,
}

/// Records the successor of a table.
///
/// Groups are written in pre-order. Untouched subtrees are carried over with
/// [`move_group`](Self::move_group), which costs the same for any subtree
/// size; groups that disappear are reported with
/// [`remove_group`](Self::remove_group) so their anchors die at commit.
pub struct SlotWriter {
    source: Rc<SlotTable>,
    entries: Vec<Entry>,
    open: Vec<OpenGroup>,
    written: usize,
    removed_anchors: Vec<Anchor>,
}

impl SlotWriter {
    pub fn source(&self) -> &Rc<SlotTable> {
        &self.source
    }

    /// Number of groups written so far.
    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    fn record_mut(&mut self, entry: usize) -> &mut GroupRecord {
        match &mut self.entries[entry] {
            Entry::Written { record, .. } => record,
            Entry::Kept { .. } => unreachable!("open group {entry} is a kept run"),
        }
    }

    fn innermost(&mut self) -> Option<&mut GroupRecord> {
        let entry = self.open.last()?.entry;
        Some(self.record_mut(entry))
    }

    pub(crate) fn start_group(&mut self, header: GroupHeader) -> usize {
        let index = self.written;
        if let Some(parent) = self.open.last_mut() {
            parent.children += 1;
        }
        self.open.push(OpenGroup {
            entry: self.entries.len(),
            index,
            children: 0,
            nodes: 0,
        });
        self.entries.push(Entry::Written {
            record: GroupRecord {
                key: header.key,
                data_key: header.data_key,
                kind: header.kind,
                size: 1,
                node_count: 0,
                node: header.node,
                slots: SmallVec::new(),
                anchor: header.anchor,
                scope: header.scope,
            },
            origin: header.origin,
        });
        self.written += 1;
        index
    }

    /// Closes the innermost open group and returns its index.
    ///
    /// # Panics
    /// Panics when no group is open.
    pub fn end_group(&mut self) -> usize {
        let open = self.open.pop().expect("end_group without an open group");
        let size = self.written - open.index;
        let record = self.record_mut(open.entry);
        record.size = size;
        record.node_count = if record.kind == GroupKind::Node {
            1
        } else {
            open.nodes
        };
        let contributed = record.node_count;
        if let Some(parent) = self.open.last_mut() {
            parent.nodes += contributed;
        }
        open.index
    }

    /// Appends a slot to the innermost open group.
    pub fn append_slot(&mut self, value: SlotValue) {
        let open = self.open.last().expect("append_slot without an open group");
        let after_children = open.children;
        self.append_raw_slot(Slot {
            value,
            after_children,
        });
    }

    pub(crate) fn append_raw_slot(&mut self, slot: Slot) {
        self.innermost()
            .expect("append_raw_slot without an open group")
            .slots
            .push(slot);
    }

    pub(crate) fn set_node(&mut self, node: NodeId) {
        if let Some(record) = self.innermost() {
            record.node = Some(node);
        }
    }

    pub(crate) fn set_scope(&mut self, scope: RecomposeScope, anchor: Anchor) {
        if let Some(record) = self.innermost() {
            record.scope = Some(scope);
            if !record.anchor.as_ref().is_some_and(|current| current.ptr_eq(&anchor)) {
                record.anchor = Some(anchor);
            }
        }
    }

    /// Carries the group at `index` of `reader` (with all descendants, slots
    /// and anchors) over to the writer's current position.
    pub fn move_group(&mut self, reader: &SlotReader, index: usize) {
        let record = reader.group(index);
        let (size, contributed) = (record.size, record.node_count);
        match self.entries.last_mut() {
            Some(Entry::Kept { start, len }) if *start + *len == index => *len += size,
            _ => self.entries.push(Entry::Kept { start: index, len: size }),
        }
        self.written += size;
        if let Some(parent) = self.open.last_mut() {
            parent.children += 1;
            parent.nodes += contributed;
        }
    }

    /// Drops the group at `index` of `reader` from the successor table.
    pub fn remove_group(&mut self, reader: &SlotReader, index: usize) {
        reader.visit_groups(index, &mut |_, record| {
            if let Some(anchor) = &record.anchor {
                self.removed_anchors.push(anchor.clone());
            }
        });
    }

    /// Finishes writing. The result must be committed to take effect.
    ///
    /// # Panics
    /// Panics when groups are still open.
    pub fn finish(mut self) -> PendingTable {
        assert!(
            self.open.is_empty(),
            "slot writer finished with {} open groups",
            self.open.len()
        );
        PendingTable {
            entries: std::mem::take(&mut self.entries),
            len: self.written,
            source_len: self.source.group_count(),
            removed_anchors: std::mem::take(&mut self.removed_anchors),
        }
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        self.source.writing.set(false);
    }
}

/// The successor of a table, recorded as edits against it.
pub struct PendingTable {
    entries: Vec<Entry>,
    len: usize,
    source_len: usize,
    removed_anchors: Vec<Anchor>,
}

impl PendingTable {
    /// Number of groups the committed table will hold.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Edits `table`, which must be the table the writer read, into the
    /// successor. Anchors of removed groups become invalid.
    ///
    /// Leading and trailing runs that kept their distance from the start or
    /// the end of the table are left in place; only the groups between them
    /// are spliced at the gap.
    pub fn commit(self, table: &mut SlotTable) {
        assert_eq!(
            table.group_count(),
            self.source_len,
            "pending table committed to a table it was not written against"
        );
        for anchor in &self.removed_anchors {
            anchor.invalidate();
        }
        let old_len = self.source_len;
        let new_len = self.len;

        let mut head = 0;
        let mut front_edge = 0;
        while let Some(entry) = self.entries.get(head) {
            if entry.origin() != Some(front_edge) {
                break;
            }
            front_edge += entry.span();
            head += 1;
        }
        let mut tail = self.entries.len();
        let mut back_edge = new_len;
        while tail > head {
            let entry = &self.entries[tail - 1];
            let start = back_edge - entry.span();
            let aligned = entry
                .origin()
                .is_some_and(|origin| origin + new_len == start + old_len);
            if !aligned {
                break;
            }
            back_edge = start;
            tail -= 1;
        }
        let old_back_edge = back_edge + old_len - new_len;

        let mut in_place = Vec::new();
        let mut spliced = Vec::new();
        let mut position = 0;
        for (at, entry) in self.entries.into_iter().enumerate() {
            let span = entry.span();
            if at < head || at >= tail {
                if let Entry::Written { record, .. } = entry {
                    in_place.push((position, record));
                }
            } else {
                spliced.push(entry);
            }
            position += span;
        }

        if front_edge < back_edge || front_edge < old_back_edge {
            log::trace!(
                "splicing groups {front_edge}..{old_back_edge} into {front_edge}..{back_edge}"
            );
            table.move_gap(front_edge);
            let mut old: Vec<Option<GroupRecord>> = Vec::with_capacity(old_back_edge - front_edge);
            for _ in front_edge..old_back_edge {
                old.push(table.back.pop());
            }
            for entry in spliced {
                match entry {
                    Entry::Kept { start, len } => {
                        for index in start..start + len {
                            let record = old[index - front_edge]
                                .take()
                                .expect("kept group consumed twice");
                            table.push_at_gap(record);
                        }
                    }
                    Entry::Written { record, .. } => table.push_at_gap(record),
                }
            }
        }
        table.extent.set(new_len);
        for (index, record) in in_place {
            table.replace(index, record);
        }
    }
}

#[cfg(test)]
#[path = "tests/slot_table_tests.rs"]
mod tests;
