//! The composer: executes composable code against the previous slot table
//! and records the successor table plus the tree edits between them.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::panic_any;
use std::rc::Rc;

use crate::applier::Node;
use crate::changes::{diff_children, Change, ChangeList};
use crate::collections::map::{HashMap, HashSet};
use crate::collections::PtrKey;
use crate::composer_context;
use crate::composition::CompositionState;
use crate::hash::hash_one;
use crate::locals::{LocalContext, LocalKey};
use crate::owned::Owned;
use crate::recomposer::RecomposerHandle;
use crate::remember::{RememberManager, RememberObserver};
use crate::scope::RecomposeScope;
use crate::slot_table::{
    GroupHeader, GroupKind, PendingTable, SlotReader, SlotTable, SlotValue, SlotWriter,
};
use crate::snapshot::{self, StateHandle};
use crate::subcompose::CompositionReference;
use crate::{Key, NodeError, NodeId, StructuralError};

pub(crate) const ROOT_KEY: Key = 0x7265_636f_6d70_0001;
pub(crate) const CONTENT_KEY: Key = 0x7265_636f_6d70_0002;
pub(crate) const PROVIDER_KEY: Key = 0x7265_636f_6d70_0003;
pub(crate) const MOVABLE_KEY: Key = 0x7265_636f_6d70_0004;
pub(crate) const REUSABLE_KEY: Key = 0x7265_636f_6d70_0005;
pub(crate) const REFERENCE_KEY: Key = 0x7265_636f_6d70_0006;

struct OldGroup {
    index: usize,
    end: usize,
    next_child: usize,
    next_slot: usize,
}

struct Candidate {
    index: usize,
    key: Key,
    data_key: Option<Key>,
    kind: GroupKind,
    used: bool,
}

/// Old children that were not matched in order. Lookups take the first unused
/// candidate with the requested keys.
struct Pending {
    candidates: Vec<Candidate>,
}

impl Pending {
    fn collect(reader: &SlotReader, start: usize, end: usize) -> Self {
        let mut candidates = Vec::new();
        let mut index = start;
        while index < end {
            let record = reader.group(index);
            candidates.push(Candidate {
                index,
                key: record.key(),
                data_key: record.data_key(),
                kind: record.kind(),
                used: false,
            });
            index = reader.skip(index);
        }
        Self { candidates }
    }
}

struct GroupFrame {
    key: Key,
    old: Option<OldGroup>,
    pending: Option<Pending>,
    inserting: bool,
    reusing: bool,
    skipped: bool,
    node_frame: bool,
    scope: Option<RecomposeScope>,
    parent_hash: Key,
    last_matched: Option<usize>,
}

impl GroupFrame {
    fn new(key: Key, parent_hash: Key) -> Self {
        Self {
            key,
            old: None,
            pending: None,
            inserting: false,
            reusing: false,
            skipped: false,
            node_frame: false,
            scope: None,
            parent_hash,
            last_matched: None,
        }
    }
}

struct NodeFrame {
    node: NodeId,
    previous: Vec<NodeId>,
    children: Vec<NodeId>,
    mark: usize,
}

struct Invalidation {
    location: usize,
    scope: RecomposeScope,
}

/// A slot read back from the previous table.
struct OldSlot {
    group: usize,
    ordinal: usize,
    value: SlotValue,
}

struct ReadFrame {
    scope: RecomposeScope,
    reads: HashMap<PtrKey, (StateHandle, u64)>,
}

struct EndedGroup {
    scope: Option<RecomposeScope>,
    skipped: bool,
}

/// What a pass produced, ready to be applied and committed.
pub(crate) struct PassOutput {
    pub(crate) table: PendingTable,
    pub(crate) changes: ChangeList,
    pub(crate) lifecycle: RememberManager,
    pub(crate) recomposed: Vec<RecomposeScope>,
    pub(crate) released: Vec<RecomposeScope>,
    pub(crate) reads: Vec<(RecomposeScope, Vec<(StateHandle, u64)>)>,
    pub(crate) writes: Vec<(StateHandle, u64)>,
}

enum WalkStep {
    Done,
    Copied,
    Entered,
    Restart {
        index: usize,
        scope: RecomposeScope,
    },
}

struct ComposerState {
    reader: SlotReader,
    writer: SlotWriter,
    frames: Vec<GroupFrame>,
    node_frames: Vec<NodeFrame>,
    changes: ChangeList,
    lifecycle: RememberManager,
    invalidations: Vec<Invalidation>,
    /// Old groups the pass has matched, copied, entered or removed.
    consumed: HashSet<usize>,
    recomposed: Vec<RecomposeScope>,
    released: Vec<RecomposeScope>,
    reads: Vec<(RecomposeScope, Vec<(StateHandle, u64)>)>,
    locals: LocalContext,
    compound_hash: Key,
    reusing: usize,
}

impl ComposerState {
    fn top(&self) -> &GroupFrame {
        self.frames.last().expect("no open group")
    }

    fn top_mut(&mut self) -> &mut GroupFrame {
        self.frames.last_mut().expect("no open group")
    }

    fn match_child(&mut self, kind: GroupKind, key: Key, data_key: Option<Key>) -> Option<(usize, bool)> {
        let Self { reader, frames, .. } = self;
        let frame = frames.last_mut()?;
        if frame.pending.is_none() {
            let old = frame.old.as_mut()?;
            let index = old.next_child;
            if index >= old.end {
                return None;
            }
            let record = reader.group(index);
            if record.key() == key && record.data_key() == data_key {
                old.next_child = reader.skip(index);
                frame.last_matched = Some(index);
                return Some((index, false));
            }
            if kind == GroupKind::Reusable && record.kind() == GroupKind::Reusable && record.key() == key {
                old.next_child = reader.skip(index);
                frame.last_matched = Some(index);
                return Some((index, true));
            }
            let end = old.end;
            old.next_child = end;
            frame.pending = Some(Pending::collect(reader, index, end));
        }
        let pending = frame.pending.as_mut()?;
        if let Some(candidate) = pending
            .candidates
            .iter_mut()
            .find(|candidate| !candidate.used && candidate.key == key && candidate.data_key == data_key)
        {
            candidate.used = true;
            log::trace!("group {key:#x} matched out of order at {}", candidate.index);
            frame.last_matched = Some(candidate.index);
            return Some((candidate.index, false));
        }
        if kind == GroupKind::Reusable {
            if let Some(candidate) = pending.candidates.iter_mut().find(|candidate| {
                !candidate.used && candidate.key == key && candidate.kind == GroupKind::Reusable
            }) {
                candidate.used = true;
                frame.last_matched = Some(candidate.index);
                return Some((candidate.index, true));
            }
        }
        None
    }

    fn begin_group(&mut self, kind: GroupKind, key: Key, data_key: Option<Key>) -> Option<usize> {
        let matched = if self.top().inserting {
            None
        } else {
            self.match_child(kind, key, data_key)
        };
        let parent_hash = self.compound_hash;
        self.compound_hash = parent_hash.rotate_left(3) ^ data_key.unwrap_or(key);
        let mut frame = GroupFrame::new(key, parent_hash);
        match matched {
            Some((index, reused)) => {
                self.consumed.insert(index);
                let mut header = GroupHeader::of(&self.reader, index);
                frame.old = Some(OldGroup {
                    index,
                    end: self.reader.group_end(index),
                    next_child: index + 1,
                    next_slot: 0,
                });
                if reused {
                    log::trace!("reusing group {key:#x} at {index}");
                    header.data_key = data_key;
                    frame.reusing = true;
                    self.reusing += 1;
                }
                self.writer.start_group(header);
            }
            None => {
                frame.inserting = true;
                self.writer.start_group(GroupHeader::new(kind, key, data_key));
            }
        }
        self.frames.push(frame);
        matched.map(|(index, _)| index)
    }

    fn next_slot(&mut self) -> Option<OldSlot> {
        let old = self.frames.last_mut()?.old.as_mut()?;
        let (group, ordinal) = (old.index, old.next_slot);
        let value = self.reader.group(group).slot(ordinal)?.clone();
        old.next_slot += 1;
        let slot = OldSlot { group, ordinal, value };
        if self.reusing > 0 {
            self.forget_slot(&slot);
            return None;
        }
        Some(slot)
    }

    fn forget_slot(&mut self, slot: &OldSlot) {
        if let Some(observer) = slot.value.observer() {
            let order = self.reader.slot_order(slot.group, slot.ordinal);
            self.lifecycle.forgetting(order, Rc::clone(observer));
        }
    }

    fn replace_slot(&mut self, previous: Option<OldSlot>, value: SlotValue) {
        if let Some(previous) = &previous {
            self.forget_slot(previous);
        }
        self.writer.append_slot(value);
    }

    fn remove_old_group(&mut self, index: usize) {
        let Self {
            reader,
            writer,
            lifecycle,
            released,
            consumed,
            ..
        } = self;
        log::trace!("removing group {:#x} at {index}", reader.group(index).key());
        consumed.insert(index);
        writer.remove_group(reader, index);
        reader.visit_slots(index, &mut |order, slot| {
            if let Some(observer) = slot.observer() {
                lifecycle.forgetting(order, Rc::clone(observer));
            }
        });
        reader.visit_groups(index, &mut |_, record| {
            if let Some(scope) = record.scope() {
                released.push(scope.clone());
            }
        });
    }

    fn end_group(&mut self) -> EndedGroup {
        let mut frame = self.frames.pop().expect("end_group without a matching start");
        if let Some(pending) = frame.pending.take() {
            for candidate in pending.candidates.into_iter().filter(|candidate| !candidate.used) {
                self.remove_old_group(candidate.index);
            }
        } else if let Some(old) = &frame.old {
            let mut index = old.next_child;
            while index < old.end {
                let next = self.reader.skip(index);
                self.remove_old_group(index);
                index = next;
            }
        }
        if let Some(old) = &frame.old {
            let record = self.reader.group(old.index);
            for ordinal in old.next_slot..record.slot_count() {
                if let Some(observer) = record.slot(ordinal).and_then(SlotValue::observer) {
                    let order = self.reader.slot_order(old.index, ordinal);
                    self.lifecycle.forgetting(order, Rc::clone(observer));
                }
            }
        }
        if frame.node_frame {
            if let Some(node_frame) = self.node_frames.pop() {
                let diff = diff_children(node_frame.node, &node_frame.previous, &node_frame.children);
                if !diff.top.is_empty() {
                    self.changes.splice(node_frame.mark, diff.top);
                }
                self.changes.extend(diff.bottom);
            }
        }
        if frame.reusing {
            self.reusing -= 1;
        }
        self.writer.end_group();
        self.compound_hash = frame.parent_hash;
        EndedGroup {
            scope: frame.scope,
            skipped: frame.skipped,
        }
    }

    fn push_node_frame(&mut self, node: NodeId, old: Option<usize>) {
        let mut previous = Vec::new();
        if let Some(index) = old {
            self.reader.collect_child_nodes(index, &mut previous);
        }
        self.node_frames.push(NodeFrame {
            node,
            previous,
            children: Vec::new(),
            mark: self.changes.mark(),
        });
        self.top_mut().node_frame = true;
    }

    fn record_child_node(&mut self, node: NodeId) {
        if let Some(frame) = self.node_frames.last_mut() {
            frame.children.push(node);
        }
    }

    fn nearest_scope(&self) -> Option<&RecomposeScope> {
        self.frames.iter().rev().find_map(|frame| frame.scope.as_ref())
    }

    /// Next old child of the innermost group that has not been consumed.
    fn peek_remaining(&self) -> Option<usize> {
        let frame = self.top();
        match &frame.pending {
            Some(pending) => pending
                .candidates
                .iter()
                .find(|candidate| !candidate.used)
                .map(|candidate| candidate.index),
            None => frame
                .old
                .as_ref()
                .filter(|old| old.next_child < old.end)
                .map(|old| old.next_child),
        }
    }

    fn consume(&mut self, index: usize) {
        self.consumed.insert(index);
        let end = self.reader.skip(index);
        let frame = self.top_mut();
        match &mut frame.pending {
            Some(pending) => {
                if let Some(candidate) = pending.candidates.iter_mut().find(|c| c.index == index) {
                    candidate.used = true;
                }
            }
            None => {
                if let Some(old) = frame.old.as_mut() {
                    old.next_child = end;
                }
            }
        }
    }

    fn has_invalidation_in(&self, start: usize, end: usize) -> bool {
        let first = self
            .invalidations
            .partition_point(|invalidation| invalidation.location < start);
        self.invalidations
            .get(first)
            .is_some_and(|invalidation| invalidation.location < end)
    }

    fn invalidation_at(&self, location: usize) -> Option<RecomposeScope> {
        let first = self
            .invalidations
            .partition_point(|invalidation| invalidation.location < location);
        self.invalidations[first..]
            .iter()
            .take_while(|invalidation| invalidation.location == location)
            .find(|invalidation| invalidation.scope.is_invalid())
            .map(|invalidation| invalidation.scope.clone())
    }

    fn insert_invalidation(&mut self, location: usize, scope: RecomposeScope) {
        let at = self
            .invalidations
            .partition_point(|invalidation| invalidation.location < location);
        let duplicate = self.invalidations[at..]
            .iter()
            .take_while(|invalidation| invalidation.location == location)
            .any(|invalidation| invalidation.scope == scope);
        if !duplicate {
            self.invalidations.insert(at, Invalidation { location, scope });
        }
    }

    /// True when the pass will still reach the old group at `location`: the
    /// group has not been consumed and its nearest consumed ancestor is open.
    ///
    /// Keyed children can be matched in any order, so comparing indices with
    /// the current position is not enough.
    fn awaits(&self, location: usize) -> bool {
        if location >= self.reader.len() || self.consumed.contains(&location) {
            return false;
        }
        let mut group = 0;
        let mut nearest = None;
        while group != location {
            if self.consumed.contains(&group) {
                nearest = Some(group);
            }
            match self
                .reader
                .children(group)
                .find(|child| self.reader.contains(*child, location))
            {
                Some(child) => group = child,
                None => return false,
            }
        }
        nearest.is_some_and(|ancestor| {
            self.frames
                .iter()
                .any(|frame| frame.old.as_ref().is_some_and(|old| old.index == ancestor))
        })
    }

    fn next_walk_step(&mut self) -> WalkStep {
        let Some(index) = self.peek_remaining() else {
            return WalkStep::Done;
        };
        let end = self.reader.group_end(index);
        if !self.has_invalidation_in(index, end) {
            self.consume(index);
            self.writer.move_group(&self.reader, index);
            let mut nodes = Vec::new();
            self.reader.collect_nodes(index, &mut nodes);
            if let Some(frame) = self.node_frames.last_mut() {
                frame.children.extend(nodes);
            }
            return WalkStep::Copied;
        }
        if let Some(scope) = self.invalidation_at(index) {
            if scope.has_restart_block() {
                return WalkStep::Restart { index, scope };
            }
            log::warn!(
                "invalid scope {} has no restart block; entering its group without re-running it",
                scope.id()
            );
            self.recomposed.push(scope);
        }
        self.consume(index);
        self.enter_old_group(index);
        WalkStep::Entered
    }

    /// Re-enters an old group without executing its content: the header and
    /// slots are carried over and its children are walked.
    fn enter_old_group(&mut self, index: usize) {
        let header = GroupHeader::of(&self.reader, index);
        let record = self.reader.group(index);
        let key = record.key();
        let data_key = record.data_key();
        let node = record.node();
        let scope = record.scope().cloned();
        let slot_count = record.slot_count();
        let end = index + record.size();
        if let Some(node) = node {
            self.record_child_node(node);
        }
        self.writer.start_group(header);
        for slot in 0..slot_count {
            if let Some(value) = self.reader.group(index).slots.get(slot).cloned() {
                self.writer.append_raw_slot(value);
            }
        }
        let parent_hash = self.compound_hash;
        self.compound_hash = parent_hash.rotate_left(3) ^ data_key.unwrap_or(key);
        let mut frame = GroupFrame::new(key, parent_hash);
        frame.old = Some(OldGroup {
            index,
            end,
            next_child: index + 1,
            next_slot: slot_count,
        });
        frame.skipped = true;
        frame.scope = scope;
        self.frames.push(frame);
        if let Some(node) = node {
            self.push_node_frame(node, Some(index));
        }
    }
}

/// Per-pass composer internals. Shared behind `Rc` so composable code can
/// reach it through the thread-local composer stack.
pub struct ComposerCore {
    composition: Rc<CompositionState>,
    state: RefCell<Option<ComposerState>>,
    reads: RefCell<Vec<ReadFrame>>,
    write_epoch: Cell<u64>,
    writes: RefCell<HashMap<PtrKey, (StateHandle, u64)>>,
    force_all: bool,
}

/// Handle passed to composable code.
#[derive(Clone)]
pub struct Composer {
    core: Rc<ComposerCore>,
}

impl Composer {
    pub(crate) fn new(
        composition: Rc<CompositionState>,
        table: &Rc<SlotTable>,
        invalid: Vec<RecomposeScope>,
        force_all: bool,
    ) -> Self {
        let mut invalidations: Vec<Invalidation> = invalid
            .into_iter()
            .filter_map(|scope| {
                scope
                    .anchor()
                    .location()
                    .map(|location| Invalidation { location, scope })
            })
            .collect();
        invalidations.sort_by_key(|invalidation| invalidation.location);
        let locals = composition.base_locals();
        let state = ComposerState {
            reader: table.open_reader(),
            writer: table.open_writer(),
            frames: Vec::new(),
            node_frames: Vec::new(),
            changes: ChangeList::default(),
            lifecycle: RememberManager::default(),
            invalidations,
            consumed: HashSet::default(),
            recomposed: Vec::new(),
            released: Vec::new(),
            reads: Vec::new(),
            locals,
            compound_hash: 0,
            reusing: 0,
        };
        Self {
            core: Rc::new(ComposerCore {
                composition,
                state: RefCell::new(Some(state)),
                reads: RefCell::new(Vec::new()),
                write_epoch: Cell::new(0),
                writes: RefCell::new(HashMap::default()),
                force_all,
            }),
        }
    }

    pub(crate) fn clone_core(&self) -> Rc<ComposerCore> {
        Rc::clone(&self.core)
    }

    pub(crate) fn from_core(core: Rc<ComposerCore>) -> Self {
        Self { core }
    }

    fn state(&self) -> Ref<'_, ComposerState> {
        Ref::map(self.core.state.borrow(), |state| {
            state.as_ref().expect("composer used after its pass finished")
        })
    }

    fn state_mut(&self) -> RefMut<'_, ComposerState> {
        RefMut::map(self.core.state.borrow_mut(), |state| {
            state.as_mut().expect("composer used after its pass finished")
        })
    }

    /// Runs `f` with this composer installed as the current composer and its
    /// read observer active.
    pub(crate) fn install<R>(&self, f: impl FnOnce(&Composer) -> R) -> R {
        let _guard = composer_context::enter(self);
        let weak = Rc::downgrade(&self.core);
        let observer: snapshot::ReadObserver = Rc::new(move |state: &StateHandle| {
            if let Some(core) = weak.upgrade() {
                Composer::from_core(core).record_read(state);
            }
        });
        snapshot::observe_reads(observer, || f(self))
    }

    pub(crate) fn start_root(&self) {
        let root = self.core.composition.root();
        let mut st = self.state_mut();
        let matched = if st.reader.is_empty() { None } else { Some(0) };
        let mut frame = GroupFrame::new(ROOT_KEY, 0);
        match matched {
            Some(index) => {
                let header = GroupHeader::of(&st.reader, index);
                frame.old = Some(OldGroup {
                    index,
                    end: st.reader.group_end(index),
                    next_child: index + 1,
                    next_slot: 0,
                });
                st.consumed.insert(index);
                st.writer.start_group(header);
            }
            None => {
                frame.inserting = true;
                st.writer
                    .start_group(GroupHeader::new(GroupKind::Root, ROOT_KEY, None));
            }
        }
        st.compound_hash = ROOT_KEY;
        st.frames.push(frame);
        st.push_node_frame(root, matched);
    }

    pub(crate) fn end_root(&self) {
        self.state_mut().end_group();
    }

    /// Runs the root content unconditionally inside its restart group.
    pub(crate) fn compose_content(&self, content: Rc<dyn Fn()>) {
        self.start_restart_group(CONTENT_KEY);
        content();
        if let Some(scope) = self.end_restart_group() {
            scope.update_scope(move |composer| composer.compose_content(Rc::clone(&content)));
        }
    }

    /// Consumes the pass state.
    pub(crate) fn finish(&self) -> PassOutput {
        let state = self
            .core
            .state
            .borrow_mut()
            .take()
            .expect("composer finished twice");
        let ComposerState {
            mut reader,
            writer,
            frames,
            changes,
            lifecycle,
            recomposed,
            released,
            reads,
            ..
        } = state;
        debug_assert!(frames.is_empty(), "pass finished with open groups");
        reader.close();
        let writes = self.core.writes.borrow_mut().drain().map(|(_, write)| write).collect();
        PassOutput {
            table: writer.finish(),
            changes,
            lifecycle,
            recomposed,
            released,
            reads,
            writes,
        }
    }

    /// Drops the pass state, notifying values it created.
    pub(crate) fn abandon(&self) {
        if let Ok(mut state) = self.core.state.try_borrow_mut() {
            if let Some(state) = state.take() {
                state.lifecycle.abandon();
            }
        }
    }

    fn record_read(&self, state: &StateHandle) {
        let epoch = self.core.write_epoch.get();
        if let Ok(mut frames) = self.core.reads.try_borrow_mut() {
            if let Some(frame) = frames.last_mut() {
                frame
                    .reads
                    .entry(snapshot::state_key(state))
                    .and_modify(|entry| entry.1 = epoch)
                    .or_insert_with(|| (Rc::clone(state), epoch));
            }
        }
    }

    /// Called for every state written inside the pass snapshot. Observers the
    /// pass has not reached yet are invalidated in place so they run in this
    /// same pass; the others are found stale at commit.
    pub(crate) fn record_write(&self, state: &StateHandle) {
        let epoch = self.core.write_epoch.get() + 1;
        self.core.write_epoch.set(epoch);
        self.core
            .writes
            .borrow_mut()
            .insert(snapshot::state_key(state), (Rc::clone(state), epoch));
        let observers = self.core.composition.observers_of(state);
        if observers.is_empty() {
            return;
        }
        let Ok(mut guard) = self.core.state.try_borrow_mut() else {
            return;
        };
        let Some(st) = guard.as_mut() else {
            return;
        };
        for scope in observers {
            if scope.is_released() {
                continue;
            }
            if let Some(location) = scope.anchor().location().filter(|location| st.awaits(*location)) {
                scope.set_invalid(true);
                st.insert_invalidation(location, scope);
            }
        }
    }

    /// Imminent invalidation requested through [`RecomposeScope::invalidate`]
    /// while this pass is running. Fails for scopes the pass has already
    /// consumed, which the caller defers to the next pass.
    pub(crate) fn try_imminent(&self, scope: &RecomposeScope) -> bool {
        let Ok(mut guard) = self.core.state.try_borrow_mut() else {
            return false;
        };
        let Some(st) = guard.as_mut() else {
            return false;
        };
        match scope.anchor().location() {
            Some(location) if st.awaits(location) => {
                scope.set_invalid(true);
                st.insert_invalidation(location, scope.clone());
                true
            }
            _ => false,
        }
    }

    // ----- groups -------------------------------------------------------

    /// Starts a replaceable group.
    pub fn start_group(&self, key: Key) {
        self.state_mut().begin_group(GroupKind::Replaceable, key, None);
    }

    pub fn end_group(&self) {
        self.state_mut().end_group();
    }

    /// Starts a group identified by `key` plus `data_key`. Siblings with the
    /// same `key` are matched by `data_key`, so reordering them moves their
    /// state and nodes instead of recreating them.
    pub fn start_movable_group(&self, key: Key, data_key: Key) {
        self.state_mut()
            .begin_group(GroupKind::Movable, key, Some(data_key));
    }

    pub fn end_movable_group(&self) {
        self.end_group();
    }

    /// Starts a group whose content can be taken over by another data key: a
    /// previous reusable group with the same `key` is recycled (keeping its
    /// nodes) and all of its remembered values are discarded.
    pub fn start_reusable_group(&self, key: Key, data_key: Key) {
        self.state_mut()
            .begin_group(GroupKind::Reusable, key, Some(data_key));
    }

    pub fn end_reusable_group(&self) {
        self.end_group();
    }

    pub fn with_group<R>(&self, key: Key, content: impl FnOnce() -> R) -> R {
        self.start_group(key);
        let result = content();
        self.end_group();
        result
    }

    /// Runs `content` in a movable group keyed by `key`.
    pub fn with_key<K: Hash + ?Sized, R>(&self, key: &K, content: impl FnOnce() -> R) -> R {
        self.start_movable_group(MOVABLE_KEY, hash_one(key));
        let result = content();
        self.end_movable_group();
        result
    }

    /// Runs `content` in a reusable group keyed by `key`.
    pub fn reusable_content<K: Hash + ?Sized, R>(&self, key: &K, content: impl FnOnce() -> R) -> R {
        self.start_reusable_group(REUSABLE_KEY, hash_one(key));
        let result = content();
        self.end_reusable_group();
        result
    }

    /// Starts a restartable group and makes its scope current for state
    /// reads.
    pub fn start_restart_group(&self, key: Key) {
        let scope = {
            let mut st = self.state_mut();
            st.begin_group(GroupKind::Restartable, key, None);
            let locals = st.locals.clone();
            let existing = st
                .top()
                .old
                .as_ref()
                .and_then(|old| st.reader.group(old.index).scope().cloned())
                .filter(|scope| !scope.is_released());
            let scope = match existing {
                Some(scope) => scope,
                None => RecomposeScope::new(Rc::downgrade(&self.core.composition), locals.clone()),
            };
            scope.set_locals(locals);
            st.writer.set_scope(scope.clone(), scope.anchor().clone());
            st.top_mut().scope = Some(scope.clone());
            scope
        };
        self.core.reads.borrow_mut().push(ReadFrame {
            scope,
            reads: HashMap::default(),
        });
    }

    /// Ends the innermost restartable group. Returns its scope so the caller
    /// can register a restart block.
    pub fn end_restart_group(&self) -> Option<RecomposeScope> {
        let frame = self.core.reads.borrow_mut().pop();
        let mut st = self.state_mut();
        let ended = st.end_group();
        let scope = ended.scope?;
        if !ended.skipped {
            let reads = frame
                .filter(|frame| frame.scope == scope)
                .map(|frame| frame.reads.into_values().collect())
                .unwrap_or_default();
            st.reads.push((scope.clone(), reads));
            st.recomposed.push(scope.clone());
        }
        Some(scope)
    }

    /// True when the current group may reuse its previous output: it is not
    /// being inserted or reused and its scope has not been invalidated.
    pub fn skipping(&self) -> bool {
        if self.core.force_all {
            return false;
        }
        let st = self.state();
        let Some(frame) = st.frames.last() else {
            return false;
        };
        !frame.inserting
            && st.reusing == 0
            && st
                .nearest_scope()
                .map_or(true, |scope| !scope.is_invalid())
    }

    pub fn inserting(&self) -> bool {
        self.state().frames.last().is_some_and(|frame| frame.inserting)
    }

    /// Keeps the rest of the current group as it was, descending only into
    /// children that contain invalidated scopes.
    ///
    /// # Panics
    /// Panics with a [`StructuralError`] when the group is being inserted.
    pub fn skip_to_group_end(&self) {
        {
            let mut st = self.state_mut();
            let position = st.writer.len();
            let ComposerState { reader, writer, frames, .. } = &mut *st;
            let frame = frames.last_mut().expect("skip_to_group_end outside of a group");
            let Some(old) = frame.old.as_mut() else {
                panic_any(StructuralError {
                    location: position,
                    expected: frame.key,
                    detail: "cannot skip a group that is being inserted".to_string(),
                });
            };
            let record = reader.group(old.index);
            for slot in record.slots.iter().skip(old.next_slot) {
                writer.append_raw_slot(slot.clone());
            }
            old.next_slot = record.slot_count();
            frame.skipped = true;
        }
        self.recompose_to_group_end();
    }

    /// Walks the remaining old children of the current group, copying the
    /// untouched ones and re-running invalidated scopes.
    pub fn recompose_to_group_end(&self) {
        loop {
            let step = self.state_mut().next_walk_step();
            match step {
                WalkStep::Done => break,
                WalkStep::Copied => {}
                WalkStep::Entered => {
                    self.recompose_to_group_end();
                    self.state_mut().end_group();
                }
                WalkStep::Restart { index, scope } => self.restart(index, scope),
            }
        }
    }

    fn restart(&self, index: usize, scope: RecomposeScope) {
        let Some(block) = scope.restart_block() else {
            return;
        };
        log::trace!("restarting scope {} at {index}", scope.id());
        let saved = {
            let mut st = self.state_mut();
            st.top_mut().last_matched = None;
            std::mem::replace(&mut st.locals, scope.locals())
        };
        block(self);
        let mut st = self.state_mut();
        st.locals = saved;
        if st.top().last_matched != Some(index) {
            let expected = st.reader.group(index).key();
            panic_any(StructuralError {
                location: index,
                expected,
                detail: "restarted content produced a different group".to_string(),
            });
        }
    }

    // ----- slots --------------------------------------------------------

    /// Compares `value` with the one stored at this position by the previous
    /// pass and stores it. Returns true when they differ or nothing was
    /// stored.
    pub fn changed<T: PartialEq + Clone + 'static>(&self, value: &T) -> bool {
        let mut st = self.state_mut();
        let previous = st.next_slot();
        let unchanged = previous
            .as_ref()
            .and_then(|slot| slot.value.downcast_ref::<T>())
            .is_some_and(|stored| stored == value);
        match previous {
            Some(slot) if unchanged => st.writer.append_slot(slot.value),
            previous => st.replace_slot(previous, SlotValue::Value(Rc::new(value.clone()))),
        }
        !unchanged
    }

    /// Returns the value cached at this position, computing it with `init`
    /// when `invalid` is set, nothing is cached, or the cached value has a
    /// different type.
    pub fn cache<T: Clone + 'static>(&self, invalid: bool, init: impl FnOnce() -> T) -> T {
        let previous = {
            let mut st = self.state_mut();
            let previous = st.next_slot();
            if !invalid {
                if let Some(slot) = &previous {
                    if let Some(value) = slot.value.downcast_ref::<T>().cloned() {
                        st.writer.append_slot(slot.value.clone());
                        return value;
                    }
                }
            }
            previous
        };
        let value = init();
        self.state_mut()
            .replace_slot(previous, SlotValue::Value(Rc::new(value.clone())));
        value
    }

    pub fn remember<T: 'static>(&self, init: impl FnOnce() -> T) -> Owned<T> {
        self.cache(false, || Owned::new(init()))
    }

    /// Like [`remember`](Self::remember) but recomputes when `key` changes.
    pub fn remember_with_key<K, T>(&self, key: &K, init: impl FnOnce() -> T) -> Owned<T>
    where
        K: PartialEq + Clone + 'static,
        T: 'static,
    {
        let invalid = self.changed(key);
        self.cache(invalid, || Owned::new(init()))
    }

    /// Remembers a value that receives lifecycle callbacks.
    pub fn remember_observer<T: RememberObserver>(&self, init: impl FnOnce() -> T) -> Rc<T> {
        self.remember_observed(false, init)
    }

    pub fn remember_observer_with_key<K, T>(&self, key: &K, init: impl FnOnce() -> T) -> Rc<T>
    where
        K: PartialEq + Clone + 'static,
        T: RememberObserver,
    {
        let invalid = self.changed(key);
        self.remember_observed(invalid, init)
    }

    fn remember_observed<T: RememberObserver>(&self, invalid: bool, init: impl FnOnce() -> T) -> Rc<T> {
        let previous = {
            let mut st = self.state_mut();
            let previous = st.next_slot();
            if !invalid {
                if let Some(OldSlot {
                    value: SlotValue::Observed { value, observer },
                    ..
                }) = &previous
                {
                    if let Ok(existing) = Rc::clone(value).downcast::<T>() {
                        st.writer.append_slot(SlotValue::Observed {
                            value: Rc::clone(value),
                            observer: Rc::clone(observer),
                        });
                        return existing;
                    }
                }
            }
            previous
        };
        let value = Rc::new(init());
        let observer: Rc<dyn RememberObserver> = value.clone();
        let mut st = self.state_mut();
        st.replace_slot(
            previous,
            SlotValue::Observed {
                value: value.clone() as Rc<dyn Any>,
                observer: Rc::clone(&observer),
            },
        );
        st.lifecycle.remembering(observer);
        value
    }

    // ----- nodes --------------------------------------------------------

    /// Emits a node group. `factory` runs (at apply time) only when the group
    /// is inserted; `update` records property changes; `content` emits the
    /// node's children.
    pub fn emit<N: Node>(
        &self,
        key: Key,
        factory: impl FnOnce() -> N + 'static,
        update: impl FnOnce(&mut Updater<'_, N>),
        content: impl FnOnce(),
    ) -> NodeId {
        let (node, inserting) = self.start_node(key, Box::new(move || Box::new(factory()) as Box<dyn Node>));
        let mut updater = Updater {
            composer: self,
            node,
            inserting,
            _marker: PhantomData,
        };
        update(&mut updater);
        content();
        self.end_node();
        node
    }

    fn start_node(&self, key: Key, factory: Box<dyn FnOnce() -> Box<dyn Node>>) -> (NodeId, bool) {
        let mut st = self.state_mut();
        let matched = st.begin_group(GroupKind::Node, key, None);
        let existing = matched.and_then(|index| st.reader.group(index).node());
        let (node, inserting) = match existing {
            Some(node) => (node, false),
            None => {
                let node = self.core.composition.allocate_node();
                st.changes.create(node, factory);
                (node, true)
            }
        };
        st.writer.set_node(node);
        // Recorded in the parent's node frame, before this node pushes its own.
        st.record_child_node(node);
        st.push_node_frame(node, if inserting { None } else { matched });
        (node, inserting)
    }

    fn end_node(&self) {
        self.state_mut().end_group();
    }

    pub(crate) fn record_change(&self, change: Change) {
        self.state_mut().changes.push(change);
    }

    // ----- context ------------------------------------------------------

    /// Rotate-xor hash of the keys of every enclosing group. Stable for a
    /// given call path across passes.
    pub fn current_compound_key_hash(&self) -> Key {
        self.state().compound_hash
    }

    pub fn current_recompose_scope(&self) -> Option<RecomposeScope> {
        self.state().nearest_scope().cloned()
    }

    /// Queues `effect` to run after the current pass has been applied.
    pub fn register_side_effect(&self, effect: impl FnOnce() + 'static) {
        self.state_mut().lifecycle.side_effect(Box::new(effect));
    }

    pub fn recomposer(&self) -> RecomposerHandle {
        self.core.composition.recomposer()
    }

    /// Reference to the current position for starting child compositions.
    /// The same reference is returned on every pass; it follows the locals
    /// visible here.
    pub fn composition_reference(&self) -> CompositionReference {
        self.with_group(REFERENCE_KEY, || {
            let locals = self.state().locals.clone();
            let composition = &self.core.composition;
            let reference = self.cache(false, || {
                CompositionReference::new(composition.id(), composition.recomposer(), locals.clone())
            });
            reference.update_locals(locals);
            reference
        })
    }

    pub(crate) fn local_entry(&self, key: LocalKey) -> Option<Rc<dyn Any>> {
        self.state().locals.get(key)
    }

    /// Runs `content` with `values` added to the composition locals.
    pub(crate) fn with_locals<R>(&self, values: Vec<(LocalKey, Rc<dyn Any>)>, content: impl FnOnce() -> R) -> R {
        let saved = {
            let mut st = self.state_mut();
            let provided = st.locals.with_values(values);
            std::mem::replace(&mut st.locals, provided)
        };
        let result = content();
        self.state_mut().locals = saved;
        result
    }
}

/// Records property updates for a node emitted with [`Composer::emit`].
pub struct Updater<'a, N> {
    composer: &'a Composer,
    node: NodeId,
    inserting: bool,
    _marker: PhantomData<fn(&mut N)>,
}

impl<N: Node> Updater<'_, N> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn inserting(&self) -> bool {
        self.inserting
    }

    /// Applies `apply` when the node is new or `value` changed.
    pub fn set<V: PartialEq + Clone + 'static>(&mut self, value: V, apply: impl FnOnce(&mut N, V) + 'static) {
        if self.composer.changed(&value) {
            self.record(move |node| apply(node, value));
        }
    }

    /// Applies `apply` when `value` changed on an existing node.
    pub fn update<V: PartialEq + Clone + 'static>(&mut self, value: V, apply: impl FnOnce(&mut N, V) + 'static) {
        if self.composer.changed(&value) && !self.inserting {
            self.record(move |node| apply(node, value));
        }
    }

    /// Applies `apply` once, right after the node is created.
    pub fn init(&mut self, apply: impl FnOnce(&mut N) + 'static) {
        if self.inserting {
            self.record(apply);
        }
    }

    /// Applies `apply` on every pass that executes this emit.
    pub fn reconcile(&mut self, apply: impl FnOnce(&mut N) + 'static) {
        self.record(apply);
    }

    fn record(&mut self, apply: impl FnOnce(&mut N) + 'static) {
        let node = self.node;
        self.composer.record_change(Change::Update {
            node,
            update: Box::new(move |target: &mut dyn Node| {
                let typed = target
                    .as_any_mut()
                    .downcast_mut::<N>()
                    .ok_or(NodeError::TypeMismatch {
                        id: node,
                        expected: std::any::type_name::<N>(),
                    })?;
                apply(typed);
                Ok(())
            }),
        });
    }
}

#[cfg(test)]
#[path = "tests/composer_tests.rs"]
mod tests;
