//! A composition: one slot table, the reads its scopes made and the applier
//! its passes write to.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::applier::Applier;
use crate::collections::map::HashSet;
use crate::collections::PtrKey;
use crate::composer::{Composer, PassOutput};
use crate::locals::LocalContext;
use crate::observer_map::ObserverMap;
use crate::recomposer::{Recomposer, RecomposerHandle};
use crate::remember::RememberObserver;
use crate::scope::{InvalidationResult, RecomposeScope, ScopeId};
use crate::slot_table::SlotTable;
use crate::snapshot::{self, MutableSnapshot, StateHandle, StateObject};
use crate::subcompose::CompositionReference;
use crate::{ComposeError, NodeId};

pub type CompositionId = u64;

thread_local! {
    static NEXT_COMPOSITION_ID: Cell<CompositionId> = const { Cell::new(1) };
}

/// What the recomposer needs from a composition, independent of its applier
/// type.
pub(crate) trait ControlledComposition {
    fn id(&self) -> CompositionId;

    fn has_invalidations(&self) -> bool;

    /// Runs one pass over the invalid scopes. Returns true when the pass did
    /// anything.
    fn recompose(&self) -> Result<bool, ComposeError>;

    /// Invalidates the scopes that read any of `states`.
    fn invalidate_states(&self, states: &[StateHandle]);

    fn is_disposed(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PassMode {
    Content,
    ForceAll,
    Invalidations,
}

/// Applier-independent part of a composition, shared with its scopes.
pub(crate) struct CompositionState {
    id: CompositionId,
    recomposer: RecomposerHandle,
    parent: Option<CompositionReference>,
    slots: RefCell<Rc<SlotTable>>,
    observations: RefCell<ObserverMap<dyn StateObject, RecomposeScope>>,
    invalid: RefCell<Vec<RecomposeScope>>,
    deferred: RefCell<Vec<RecomposeScope>>,
    own_writes: RefCell<Option<HashSet<PtrKey>>>,
    active: RefCell<Option<Composer>>,
    content: RefCell<Option<Rc<dyn Fn()>>>,
    root: NodeId,
    next_node: Cell<NodeId>,
    composing: Cell<bool>,
    disposed: Cell<bool>,
    /// The next pass re-executes the whole content.
    force_all: Cell<bool>,
}

impl CompositionState {
    pub(crate) fn id(&self) -> CompositionId {
        self.id
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn allocate_node(&self) -> NodeId {
        let node = self.next_node.get();
        self.next_node.set(node + 1);
        node
    }

    pub(crate) fn recomposer(&self) -> RecomposerHandle {
        self.recomposer.clone()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Locals every pass starts from: the parent's when this is a child
    /// composition.
    pub(crate) fn base_locals(&self) -> LocalContext {
        self.parent
            .as_ref()
            .map(CompositionReference::locals)
            .unwrap_or_default()
    }

    /// Schedules a pass that re-executes the whole content.
    pub(crate) fn invalidate_all(&self) {
        if self.disposed.get() {
            return;
        }
        self.force_all.set(true);
        self.recomposer.schedule(self.id);
    }

    pub(crate) fn observers_of(&self, state: &StateHandle) -> Vec<RecomposeScope> {
        self.observations.borrow().get(state).to_vec()
    }

    pub(crate) fn invalidate_scope(&self, scope: &RecomposeScope) -> InvalidationResult {
        if self.disposed.get() {
            log::warn!("invalidation of scope {} in disposed composition {}", scope.id(), self.id);
            return InvalidationResult::Ignored;
        }
        if scope.is_released() {
            return InvalidationResult::Ignored;
        }
        if self.composing.get() {
            let active = self.active.borrow().clone();
            if active.is_some_and(|composer| composer.try_imminent(scope)) {
                return InvalidationResult::Imminent;
            }
            self.deferred.borrow_mut().push(scope.clone());
            return InvalidationResult::Deferred;
        }
        scope.set_invalid(true);
        if scope.enqueue() {
            self.invalid.borrow_mut().push(scope.clone());
        }
        self.recomposer.schedule(self.id);
        InvalidationResult::Scheduled
    }

    fn take_invalid(&self) -> Vec<RecomposeScope> {
        let scopes = std::mem::take(&mut *self.invalid.borrow_mut());
        for scope in &scopes {
            scope.dequeue();
        }
        scopes
            .into_iter()
            .filter(|scope| !scope.is_released() && scope.is_invalid())
            .collect()
    }

    fn requeue(&self, scopes: impl IntoIterator<Item = RecomposeScope>) {
        let mut invalid = self.invalid.borrow_mut();
        for scope in scopes {
            if scope.is_released() {
                continue;
            }
            scope.set_invalid(true);
            if scope.enqueue() {
                invalid.push(scope);
            }
        }
    }

    fn release_scope(&self, scope: &RecomposeScope) {
        let mut observations = self.observations.borrow_mut();
        for state in scope.take_reads() {
            observations.remove(&state, scope);
        }
        scope.release();
    }

    fn record_reads(&self, scope: &RecomposeScope, reads: Vec<StateHandle>) {
        let mut observations = self.observations.borrow_mut();
        for state in scope.replace_reads(Vec::new()) {
            observations.remove(&state, scope);
        }
        for state in &reads {
            observations.add(state, scope.clone());
        }
        scope.replace_reads(reads);
    }

    /// Forgets every remembered value still in the table, newest first.
    fn forget_all(&self) {
        let table = Rc::clone(&*self.slots.borrow());
        if table.is_empty() {
            return;
        }
        let mut reader = table.open_reader();
        let mut observers: Vec<Rc<dyn RememberObserver>> = Vec::new();
        let mut scopes = Vec::new();
        reader.visit_slots(0, &mut |_, slot| {
            if let Some(observer) = slot.observer() {
                observers.push(Rc::clone(observer));
            }
        });
        reader.visit_groups(0, &mut |_, record| {
            if let Some(scope) = record.scope() {
                scopes.push(scope.clone());
            }
        });
        reader.close();
        for scope in &scopes {
            self.release_scope(scope);
        }
        for observer in observers.iter().rev() {
            observer.on_forgotten();
        }
    }
}

impl fmt::Debug for CompositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositionState")
            .field("id", &self.id)
            .field("invalid", &self.invalid.borrow().len())
            .field("composing", &self.composing.get())
            .field("disposed", &self.disposed.get())
            .field("child", &self.parent.is_some())
            .finish()
    }
}

struct ComposingGuard<'a>(&'a Cell<bool>);

impl Drop for ComposingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

struct CompositionInner<A: Applier> {
    state: Rc<CompositionState>,
    applier: RefCell<A>,
}

impl<A: Applier + 'static> CompositionInner<A> {
    fn run_pass(&self, mode: PassMode) -> Result<bool, ComposeError> {
        let state = &self.state;
        if state.disposed.get() {
            return Err(ComposeError::Disposed);
        }
        if state.composing.replace(true) {
            return Err(ComposeError::Reentrant);
        }
        let _composing = ComposingGuard(&state.composing);

        let forced = state.force_all.replace(false);
        let mode = match mode {
            PassMode::Invalidations if forced => PassMode::ForceAll,
            mode => mode,
        };
        let invalid = state.take_invalid();
        let content = match mode {
            PassMode::Content | PassMode::ForceAll => state.content.borrow().clone(),
            PassMode::Invalidations => None,
        };
        let table = Rc::clone(&*state.slots.borrow());
        if content.is_none() && (invalid.is_empty() || table.is_empty()) {
            return Ok(false);
        }
        log::debug!(
            "composition {} pass ({mode:?}) with {} invalid scopes",
            state.id,
            invalid.len()
        );

        let composer = Composer::new(Rc::clone(state), &table, invalid.clone(), mode == PassMode::ForceAll);
        // The installed table is edited in place at commit when nothing else
        // holds it.
        drop(table);
        *state.active.borrow_mut() = Some(composer.clone());
        let writes = composer.clone();
        let observer: snapshot::WriteObserver = Rc::new(move |written: &StateHandle| writes.record_write(written));
        let snapshot = MutableSnapshot::with_write_observer(Some(observer));
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            snapshot.enter(|| {
                composer.install(|composer| {
                    composer.start_root();
                    match content {
                        Some(content) => composer.compose_content(content),
                        None => composer.recompose_to_group_end(),
                    }
                    composer.end_root();
                })
            })
        }));
        state.active.borrow_mut().take();

        match outcome {
            Ok(()) => {
                let output = composer.finish();
                let committed = self.commit(output, snapshot, invalid);
                if committed.is_err() {
                    state.force_all.set(forced);
                }
                committed
            }
            Err(payload) => {
                snapshot.discard();
                composer.abandon();
                let error = ComposeError::from_panic(payload);
                match &error {
                    ComposeError::Structure(structure) => log::error!("composition {}: {structure}", state.id),
                    other => log::warn!("composition {} abandoned its pass: {other}", state.id),
                }
                let deferred = std::mem::take(&mut *state.deferred.borrow_mut());
                state.requeue(invalid.into_iter().chain(deferred));
                state.force_all.set(forced);
                Err(error)
            }
        }
    }

    fn commit(
        &self,
        output: PassOutput,
        snapshot: MutableSnapshot,
        invalid: Vec<RecomposeScope>,
    ) -> Result<bool, ComposeError> {
        let state = &self.state;
        let PassOutput {
            table,
            changes,
            lifecycle,
            recomposed,
            released,
            reads,
            writes,
        } = output;
        let change_count = changes.changes().len();
        let applied = changes.apply(&mut *self.applier.borrow_mut());
        if let Err(error) = applied {
            log::warn!("composition {} failed to apply changes: {error}", state.id);
            snapshot.discard();
            lifecycle.abandon();
            let deferred = std::mem::take(&mut *state.deferred.borrow_mut());
            state.requeue(invalid.into_iter().chain(deferred));
            return Err(error.into());
        }

        table.commit(Rc::make_mut(&mut *state.slots.borrow_mut()));
        for scope in &recomposed {
            scope.mark_recomposed();
        }
        for scope in &released {
            state.release_scope(scope);
        }
        for scope in invalid.iter().filter(|scope| scope.is_invalid()) {
            log::debug!("scope {} was not reached by its pass", scope.id());
            scope.mark_recomposed();
        }

        // A reader that re-read a state after this pass wrote it is current;
        // every other reader is stale.
        let mut fresh: HashSet<(PtrKey, ScopeId)> = HashSet::default();
        let last_write: crate::collections::map::HashMap<PtrKey, u64> = writes
            .iter()
            .map(|(written, epoch)| (snapshot::state_key(written), *epoch))
            .collect();
        for (scope, scope_reads) in reads {
            if scope.is_released() {
                continue;
            }
            for (read, epoch) in &scope_reads {
                let key = snapshot::state_key(read);
                if last_write.get(&key).is_some_and(|written| epoch >= written) {
                    fresh.insert((key, scope.id()));
                }
            }
            state.record_reads(&scope, scope_reads.into_iter().map(|(read, _)| read).collect());
        }
        let mut stale = Vec::new();
        for (written, _) in &writes {
            let key = snapshot::state_key(written);
            for scope in state.observers_of(written) {
                if !fresh.contains(&(key, scope.id())) {
                    stale.push(scope);
                }
            }
        }

        state.composing.set(false);
        *state.own_writes.borrow_mut() = Some(last_write.keys().copied().collect());
        snapshot.apply();
        state.own_writes.borrow_mut().take();

        let deferred = std::mem::take(&mut *state.deferred.borrow_mut());
        for scope in deferred.iter().chain(&stale) {
            state.invalidate_scope(scope);
        }
        lifecycle.dispatch();
        log::debug!(
            "composition {} pass done: {} changes, {} scopes recomposed",
            state.id,
            change_count,
            recomposed.len()
        );
        Ok(change_count > 0 || !recomposed.is_empty())
    }
}

impl<A: Applier + 'static> ControlledComposition for CompositionInner<A> {
    fn id(&self) -> CompositionId {
        self.state.id
    }

    fn has_invalidations(&self) -> bool {
        self.state.force_all.get() || !self.state.invalid.borrow().is_empty()
    }

    fn recompose(&self) -> Result<bool, ComposeError> {
        self.run_pass(PassMode::Invalidations)
    }

    fn invalidate_states(&self, states: &[StateHandle]) {
        if self.state.disposed.get() {
            return;
        }
        let scopes: Vec<RecomposeScope> = {
            let own = self.state.own_writes.borrow();
            let observations = self.state.observations.borrow();
            states
                .iter()
                .filter(|state| {
                    own.as_ref()
                        .map_or(true, |own| !own.contains(&snapshot::state_key(state)))
                })
                .flat_map(|state| observations.get(state).iter().cloned())
                .collect()
        };
        for scope in scopes {
            self.state.invalidate_scope(&scope);
        }
    }

    fn is_disposed(&self) -> bool {
        self.state.disposed.get()
    }
}

/// A composition bound to an applier.
///
/// ```ignore
/// let recomposer = Recomposer::new(Arc::new(ManualScheduler));
/// let mut composition = Composition::new(TreeApplier::new(), &recomposer);
/// composition.set_content(|| app())?;
/// recomposer.run_frame(0)?;
/// ```
pub struct Composition<A: Applier + 'static> {
    inner: Rc<CompositionInner<A>>,
}

impl<A: Applier + 'static> Composition<A> {
    pub fn new(applier: A, recomposer: &Recomposer) -> Self {
        Self::create(applier, recomposer.handle(), None)
    }

    /// Creates a child composition of the one `parent` was composed in.
    ///
    /// Passes start from the locals visible at `parent`, the parent's
    /// recomposer schedules them, and a change to the entries provided at
    /// `parent` re-executes the whole child content.
    pub fn with_parent(applier: A, parent: &CompositionReference) -> Self {
        let composition = Self::create(applier, parent.recomposer(), Some(parent.clone()));
        parent.attach(&composition.inner.state);
        log::debug!(
            "composition {} started as a child of composition {}",
            composition.id(),
            parent.parent()
        );
        composition
    }

    fn create(applier: A, recomposer: RecomposerHandle, parent: Option<CompositionReference>) -> Self {
        let id = NEXT_COMPOSITION_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });
        let root = applier.root();
        let state = Rc::new(CompositionState {
            id,
            recomposer: recomposer.clone(),
            parent,
            slots: RefCell::new(Rc::new(SlotTable::new())),
            observations: RefCell::new(ObserverMap::new()),
            invalid: RefCell::new(Vec::new()),
            deferred: RefCell::new(Vec::new()),
            own_writes: RefCell::new(None),
            active: RefCell::new(None),
            content: RefCell::new(None),
            root,
            next_node: Cell::new(root + 1),
            composing: Cell::new(false),
            disposed: Cell::new(false),
            force_all: Cell::new(false),
        });
        let inner = Rc::new(CompositionInner {
            state,
            applier: RefCell::new(applier),
        });
        let controlled: Rc<dyn ControlledComposition> = inner.clone();
        let weak: Weak<dyn ControlledComposition> = Rc::downgrade(&controlled);
        recomposer.register(id, weak);
        Self { inner }
    }

    pub fn id(&self) -> CompositionId {
        self.inner.state.id
    }

    /// Installs `content` and composes it right away. Unchanged parts of a
    /// previous content are kept.
    pub fn set_content(&mut self, content: impl Fn() + 'static) -> Result<bool, ComposeError> {
        if self.is_disposed() {
            return Err(ComposeError::Disposed);
        }
        *self.inner.state.content.borrow_mut() = Some(Rc::new(content));
        self.inner.run_pass(PassMode::Content)
    }

    /// Runs a pass over the pending invalidations, if any.
    pub fn recompose(&mut self) -> Result<bool, ComposeError> {
        self.inner.run_pass(PassMode::Invalidations)
    }

    /// Re-executes the whole content without skipping anything.
    pub fn force_recompose_all(&mut self) -> Result<bool, ComposeError> {
        self.inner.run_pass(PassMode::ForceAll)
    }

    pub fn has_invalidations(&self) -> bool {
        self.inner.has_invalidations()
    }

    pub fn is_composing(&self) -> bool {
        self.inner.state.composing.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.disposed.get()
    }

    pub fn root(&self) -> NodeId {
        self.inner.state.root
    }

    pub fn applier(&self) -> Ref<'_, A> {
        self.inner.applier.borrow()
    }

    pub fn applier_mut(&mut self) -> RefMut<'_, A> {
        self.inner.applier.borrow_mut()
    }

    /// The committed table, for inspection.
    pub fn slot_table(&self) -> Rc<SlotTable> {
        Rc::clone(&*self.inner.state.slots.borrow())
    }

    /// Tears the composition down: every remembered value is forgotten
    /// (newest first), the applier is cleared and the recomposer stops
    /// tracking it. Later passes fail with [`ComposeError::Disposed`].
    pub fn dispose(&mut self) -> Result<(), ComposeError> {
        let state = &self.inner.state;
        if state.disposed.get() {
            return Ok(());
        }
        if state.composing.get() {
            return Err(ComposeError::Reentrant);
        }
        log::debug!("disposing composition {}", state.id);
        state.disposed.set(true);
        state.force_all.set(false);
        state.invalid.borrow_mut().clear();
        state.deferred.borrow_mut().clear();
        state.content.borrow_mut().take();
        state.forget_all();
        *state.slots.borrow_mut() = Rc::new(SlotTable::new());
        state.recomposer.unregister(state.id);
        let mut applier = self.inner.applier.borrow_mut();
        applier.on_begin_changes();
        let cleared = applier.clear();
        applier.on_end_changes();
        cleared.map_err(ComposeError::from)
    }
}

/// Dropping a composition disposes it: remembered values are forgotten,
/// which also cancels the effects they launched.
impl<A: Applier + 'static> Drop for Composition<A> {
    fn drop(&mut self) {
        if self.is_disposed() {
            return;
        }
        if let Err(error) = self.dispose() {
            log::warn!("composition {} was dropped without a clean dispose: {error}", self.id());
            self.inner.state.recomposer.unregister(self.inner.state.id);
        }
    }
}

impl<A: Applier + 'static> fmt::Debug for Composition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.state.fmt(f)
    }
}

#[cfg(test)]
#[path = "tests/composition_tests.rs"]
mod tests;
