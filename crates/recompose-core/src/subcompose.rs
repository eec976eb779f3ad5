//! Child compositions started from a point inside another composition.
//!
//! A [`CompositionReference`] is remembered where
//! [`composition_reference`](crate::composition_reference) is called. A
//! composition created with [`Composition::with_parent`](crate::Composition::with_parent)
//! starts from the locals visible at that point, shares the parent's
//! recomposer, and recomposes everything when the parent changes which
//! entries are provided there.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::composition::{CompositionId, CompositionState};
use crate::locals::LocalContext;
use crate::recomposer::RecomposerHandle;

struct ReferenceInner {
    parent: CompositionId,
    recomposer: RecomposerHandle,
    locals: RefCell<LocalContext>,
    children: RefCell<Vec<Weak<CompositionState>>>,
}

/// Handle to a position in a parent composition. Clones share the same
/// position; the same reference is returned on every pass.
#[derive(Clone)]
pub struct CompositionReference {
    inner: Rc<ReferenceInner>,
}

impl CompositionReference {
    pub(crate) fn new(parent: CompositionId, recomposer: RecomposerHandle, locals: LocalContext) -> Self {
        Self {
            inner: Rc::new(ReferenceInner {
                parent,
                recomposer,
                locals: RefCell::new(locals),
                children: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Composition the reference was created in.
    pub fn parent(&self) -> CompositionId {
        self.inner.parent
    }

    pub fn recomposer(&self) -> RecomposerHandle {
        self.inner.recomposer.clone()
    }

    pub(crate) fn locals(&self) -> LocalContext {
        self.inner.locals.borrow().clone()
    }

    pub(crate) fn attach(&self, child: &Rc<CompositionState>) {
        let mut children = self.inner.children.borrow_mut();
        children.retain(|child| child.strong_count() > 0);
        children.push(Rc::downgrade(child));
    }

    fn live_children(&self) -> Vec<Rc<CompositionState>> {
        self.inner
            .children
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|child| !child.is_disposed())
            .collect()
    }

    /// Child compositions that are alive and not disposed.
    pub fn child_count(&self) -> usize {
        self.live_children().len()
    }

    /// Stores the locals visible where the reference is composed. Children
    /// are fully recomposed when an entry was added, removed or replaced;
    /// a changed value behind the same entry reaches its readers through
    /// state invalidation.
    pub(crate) fn update_locals(&self, locals: LocalContext) {
        let changed = !self.inner.locals.borrow().same_entries(&locals);
        if !changed {
            return;
        }
        *self.inner.locals.borrow_mut() = locals;
        log::debug!(
            "locals of a reference in composition {} changed; invalidating its children",
            self.inner.parent
        );
        self.invalidate_children();
    }

    /// Schedules a pass that re-executes the whole content of every child.
    pub fn invalidate_children(&self) {
        for child in self.live_children() {
            child.invalidate_all();
        }
    }
}

impl PartialEq for CompositionReference {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CompositionReference {}

impl fmt::Debug for CompositionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositionReference")
            .field("parent", &self.inner.parent)
            .field("locals", &*self.inner.locals.borrow())
            .field("children", &self.child_count())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/subcompose_tests.rs"]
mod tests;
