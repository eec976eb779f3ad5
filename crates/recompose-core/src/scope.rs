use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::composition::CompositionState;
use crate::locals::LocalContext;
use crate::slot_table::Anchor;
use crate::snapshot::StateHandle;
use crate::Composer;

pub type ScopeId = u64;

/// Re-executes a restartable group in place.
pub(crate) type RestartBlock = Rc<dyn Fn(&Composer)>;

/// Outcome of [`RecomposeScope::invalidate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidationResult {
    /// The scope is gone or its composition is disposed.
    Ignored,
    /// The scope will run in the next recomposition pass.
    Scheduled,
    /// The scope will run later in the pass that is currently composing.
    Imminent,
    /// Recorded during a pass for a scope that pass has already visited; it
    /// runs in the following pass.
    Deferred,
}

thread_local! {
    static NEXT_SCOPE_ID: Cell<ScopeId> = const { Cell::new(1) };
}

fn next_scope_id() -> ScopeId {
    NEXT_SCOPE_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    })
}

pub(crate) struct RecomposeScopeInner {
    id: ScopeId,
    composition: Weak<CompositionState>,
    anchor: Anchor,
    invalid: Cell<bool>,
    queued: Cell<bool>,
    released: Cell<bool>,
    block: RefCell<Option<RestartBlock>>,
    reads: RefCell<Vec<StateHandle>>,
    locals: RefCell<LocalContext>,
}

/// A restartable group: the unit of invalidation.
///
/// State read while the group executes is attributed to its scope. Writing
/// such state invalidates the scope, and the next pass re-runs just this
/// group through the restart block registered with
/// [`update_scope`](Self::update_scope).
#[derive(Clone)]
pub struct RecomposeScope {
    inner: Rc<RecomposeScopeInner>,
}

impl RecomposeScope {
    pub(crate) fn new(composition: Weak<CompositionState>, locals: LocalContext) -> Self {
        Self {
            inner: Rc::new(RecomposeScopeInner {
                id: next_scope_id(),
                composition,
                anchor: Anchor::new(),
                invalid: Cell::new(false),
                queued: Cell::new(false),
                released: Cell::new(false),
                block: RefCell::new(None),
                reads: RefCell::new(Vec::new()),
                locals: RefCell::new(locals),
            }),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn anchor(&self) -> &Anchor {
        &self.inner.anchor
    }

    pub fn is_invalid(&self) -> bool {
        self.inner.invalid.get()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.get()
    }

    pub fn has_restart_block(&self) -> bool {
        self.inner.block.borrow().is_some()
    }

    /// Requests that this scope run again.
    pub fn invalidate(&self) -> InvalidationResult {
        if self.is_released() {
            return InvalidationResult::Ignored;
        }
        match self.inner.composition.upgrade() {
            Some(composition) => composition.invalidate_scope(self),
            None => InvalidationResult::Ignored,
        }
    }

    /// Registers the closure that re-executes this group.
    pub fn update_scope(&self, block: impl Fn(&Composer) + 'static) {
        *self.inner.block.borrow_mut() = Some(Rc::new(block));
    }

    pub(crate) fn restart_block(&self) -> Option<RestartBlock> {
        self.inner.block.borrow().clone()
    }

    pub(crate) fn composition(&self) -> Option<Rc<CompositionState>> {
        self.inner.composition.upgrade()
    }

    pub(crate) fn set_invalid(&self, invalid: bool) {
        self.inner.invalid.set(invalid);
    }

    /// Marks the scope as queued for the next pass. Returns false when it was
    /// already queued.
    pub(crate) fn enqueue(&self) -> bool {
        !self.inner.queued.replace(true)
    }

    pub(crate) fn dequeue(&self) {
        self.inner.queued.set(false);
    }

    pub(crate) fn mark_recomposed(&self) {
        self.inner.invalid.set(false);
        self.inner.queued.set(false);
    }

    /// Detaches the scope after its group left the composition.
    pub(crate) fn release(&self) {
        self.inner.released.set(true);
        self.inner.invalid.set(false);
        self.inner.block.borrow_mut().take();
    }

    pub(crate) fn replace_reads(&self, reads: Vec<StateHandle>) -> Vec<StateHandle> {
        std::mem::replace(&mut *self.inner.reads.borrow_mut(), reads)
    }

    pub(crate) fn take_reads(&self) -> Vec<StateHandle> {
        std::mem::take(&mut *self.inner.reads.borrow_mut())
    }

    pub(crate) fn locals(&self) -> LocalContext {
        self.inner.locals.borrow().clone()
    }

    pub(crate) fn set_locals(&self, locals: LocalContext) {
        *self.inner.locals.borrow_mut() = locals;
    }
}

impl PartialEq for RecomposeScope {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for RecomposeScope {}

impl Hash for RecomposeScope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for RecomposeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomposeScope")
            .field("id", &self.inner.id)
            .field("anchor", &self.inner.anchor)
            .field("invalid", &self.inner.invalid.get())
            .field("released", &self.inner.released.get())
            .finish()
    }
}
