use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::snapshot::{self, StateHandle, StateId, StateObject};

struct StateCell<T> {
    id: StateId,
    value: RefCell<T>,
}

impl<T: Clone + PartialEq + 'static> StateObject for StateCell<T> {
    fn state_id(&self) -> StateId {
        self.id
    }

    fn commit_value(&self, value: Box<dyn Any>) {
        match value.downcast::<T>() {
            Ok(value) => *self.value.borrow_mut() = *value,
            Err(_) => log::error!("state {} received a value of the wrong type", self.id),
        }
    }
}

/// Observable, snapshot-aware mutable value.
///
/// Reads made while composing subscribe the current recompose scope; writes
/// of a different value invalidate every subscribed scope. Writing a value
/// equal to the current one is a no-op.
pub struct MutableState<T> {
    inner: Rc<StateCell<T>>,
}

impl<T> Clone for MutableState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// States compare by identity, so a composable taking a state parameter is
/// skipped while it keeps receiving the same state object.
impl<T> PartialEq for MutableState<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for MutableState<T> {}

impl<T: Clone + PartialEq + 'static> MutableState<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(StateCell {
                id: snapshot::next_state_id(),
                value: RefCell::new(value),
            }),
        }
    }

    pub fn id(&self) -> StateId {
        self.inner.id
    }

    pub fn handle(&self) -> StateHandle {
        self.inner.clone()
    }

    /// Reads the value, recording the read for the current observer.
    pub fn get(&self) -> T {
        self.with(|value| value.clone())
    }

    /// Same as [`get`](Self::get).
    pub fn value(&self) -> T {
        self.get()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        snapshot::record_read(&self.handle());
        self.with_untracked(f)
    }

    /// Reads without subscribing anyone.
    pub fn get_untracked(&self) -> T {
        self.with_untracked(|value| value.clone())
    }

    fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let pending = snapshot::with_pending(self.inner.id, |value| value.downcast_ref::<T>().cloned())
            .flatten();
        match pending {
            Some(value) => f(&value),
            None => f(&*self.inner.value.borrow()),
        }
    }

    pub fn set(&self, value: T) {
        let unchanged = self.with_untracked(|current| *current == value);
        if unchanged {
            return;
        }
        if let Some(value) = snapshot::record_write(self.handle(), Box::new(value)) {
            self.inner.commit_value(value);
            snapshot::notify_apply_observers(&[self.handle()]);
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.get_untracked();
        f(&mut value);
        self.set(value);
    }

    pub fn replace(&self, value: T) -> T {
        let previous = self.get_untracked();
        self.set(value);
        previous
    }

    pub fn as_state(&self) -> State<T> {
        State {
            inner: self.clone(),
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> fmt::Debug for MutableState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableState")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .finish()
    }
}

/// Read-only view of a [`MutableState`].
pub struct State<T> {
    inner: MutableState<T>,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for State<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T: Clone + PartialEq + 'static> State<T> {
    pub fn get(&self) -> T {
        self.inner.get()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.with(f)
    }
}

pub fn mutable_state_of<T: Clone + PartialEq + 'static>(value: T) -> MutableState<T> {
    MutableState::new(value)
}
