//! Observable state plumbing: read observation, mutable snapshots and apply
//! notifications.
//!
//! Writes made while a [`MutableSnapshot`] is entered stay private to that
//! snapshot until it is applied; reads inside the snapshot see them. Applying
//! the outermost snapshot installs every pending value at once and sends a
//! single notification listing all modified states. Writes made outside any
//! snapshot commit immediately and notify right away.
//!
//! All of this is per thread. State objects are `Rc` based and cross-thread
//! updates go through `UiDispatcher::post`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::collections::PtrKey;

pub type StateId = u64;

/// A piece of observable state.
pub trait StateObject: 'static {
    fn state_id(&self) -> StateId;

    /// Installs a value that was written inside a snapshot.
    fn commit_value(&self, value: Box<dyn Any>);
}

pub type StateHandle = Rc<dyn StateObject>;

pub type ReadObserver = Rc<dyn Fn(&StateHandle)>;
pub type WriteObserver = Rc<dyn Fn(&StateHandle)>;
type ApplyObserver = Rc<dyn Fn(&[StateHandle])>;

thread_local! {
    static NEXT_STATE_ID: Cell<StateId> = const { Cell::new(1) };
    static NEXT_SNAPSHOT_ID: Cell<u64> = const { Cell::new(1) };
    static NEXT_OBSERVER_ID: Cell<u64> = const { Cell::new(1) };
    static READ_OBSERVERS: RefCell<Vec<Option<ReadObserver>>> = const { RefCell::new(Vec::new()) };
    static ACTIVE_SNAPSHOTS: RefCell<Vec<Rc<SnapshotInner>>> = const { RefCell::new(Vec::new()) };
    static APPLY_OBSERVERS: RefCell<Vec<(u64, ApplyObserver)>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn next_state_id() -> StateId {
    NEXT_STATE_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    })
}

struct ObserverGuard;

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        READ_OBSERVERS.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Runs `f` with `observer` receiving every state read on this thread.
pub fn observe_reads<R>(observer: ReadObserver, f: impl FnOnce() -> R) -> R {
    READ_OBSERVERS.with(|stack| stack.borrow_mut().push(Some(observer)));
    let _guard = ObserverGuard;
    f()
}

/// Runs `f` without reporting its reads to any enclosing observer.
pub fn without_read_observation<R>(f: impl FnOnce() -> R) -> R {
    READ_OBSERVERS.with(|stack| stack.borrow_mut().push(None));
    let _guard = ObserverGuard;
    f()
}

pub(crate) fn record_read(state: &StateHandle) {
    let observer = READ_OBSERVERS.with(|stack| stack.borrow().last().cloned().flatten());
    if let Some(observer) = observer {
        observer(state);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SnapshotStatus {
    Open,
    Applied,
    Discarded,
}

struct PendingWrite {
    state: StateHandle,
    value: Box<dyn Any>,
}

struct SnapshotInner {
    id: u64,
    writes: RefCell<Vec<PendingWrite>>,
    write_observer: Option<WriteObserver>,
    status: Cell<SnapshotStatus>,
    entered: Cell<usize>,
}

impl SnapshotInner {
    fn find(&self, id: StateId) -> Option<usize> {
        self.writes
            .borrow()
            .iter()
            .position(|write| write.state.state_id() == id)
    }

    fn record(&self, state: StateHandle, value: Box<dyn Any>) {
        {
            let mut writes = self.writes.borrow_mut();
            let id = state.state_id();
            match writes.iter_mut().find(|write| write.state.state_id() == id) {
                Some(existing) => existing.value = value,
                None => writes.push(PendingWrite {
                    state: Rc::clone(&state),
                    value,
                }),
            }
        }
        if let Some(observer) = &self.write_observer {
            observer(&state);
        }
    }
}

/// An isolated set of state writes that is applied or discarded as a unit.
pub struct MutableSnapshot {
    inner: Rc<SnapshotInner>,
}

impl MutableSnapshot {
    pub fn take() -> Self {
        Self::with_write_observer(None)
    }

    /// `observer` sees every state written inside the snapshot, at write time.
    pub fn with_write_observer(observer: Option<WriteObserver>) -> Self {
        let id = NEXT_SNAPSHOT_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });
        Self {
            inner: Rc::new(SnapshotInner {
                id,
                writes: RefCell::new(Vec::new()),
                write_observer: observer,
                status: Cell::new(SnapshotStatus::Open),
                entered: Cell::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.inner.writes.borrow().is_empty()
    }

    /// Runs `f` with this snapshot as the innermost active snapshot.
    ///
    /// # Panics
    /// Panics if the snapshot was already applied or discarded.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        assert_eq!(
            self.inner.status.get(),
            SnapshotStatus::Open,
            "entering a closed snapshot"
        );
        struct EnterGuard(Rc<SnapshotInner>);
        impl Drop for EnterGuard {
            fn drop(&mut self) {
                self.0.entered.set(self.0.entered.get() - 1);
                ACTIVE_SNAPSHOTS.with(|stack| {
                    stack.borrow_mut().pop();
                });
            }
        }
        self.inner.entered.set(self.inner.entered.get() + 1);
        ACTIVE_SNAPSHOTS.with(|stack| stack.borrow_mut().push(Rc::clone(&self.inner)));
        let _guard = EnterGuard(Rc::clone(&self.inner));
        f()
    }

    /// Publishes the snapshot's writes and returns the modified states.
    ///
    /// When another snapshot is active the writes are handed to it instead of
    /// being committed; they become visible globally when that one applies.
    pub fn apply(self) -> Vec<StateHandle> {
        assert_eq!(
            self.inner.entered.get(),
            0,
            "applying a snapshot from inside itself"
        );
        self.inner.status.set(SnapshotStatus::Applied);
        let writes = std::mem::take(&mut *self.inner.writes.borrow_mut());
        if writes.is_empty() {
            return Vec::new();
        }
        let modified: Vec<StateHandle> = writes.iter().map(|write| Rc::clone(&write.state)).collect();
        match current() {
            Some(parent) => {
                for write in writes {
                    parent.record(write.state, write.value);
                }
            }
            None => {
                for write in writes {
                    write.state.commit_value(write.value);
                }
                log::trace!(
                    "snapshot {} applied {} writes",
                    self.inner.id,
                    modified.len()
                );
                notify_apply_observers(&modified);
            }
        }
        modified
    }

    /// Drops every pending write.
    pub fn discard(self) {
        self.inner.status.set(SnapshotStatus::Discarded);
        self.inner.writes.borrow_mut().clear();
    }
}

impl Drop for MutableSnapshot {
    fn drop(&mut self) {
        if self.inner.status.get() == SnapshotStatus::Open {
            self.inner.status.set(SnapshotStatus::Discarded);
            self.inner.writes.borrow_mut().clear();
        }
    }
}

impl fmt::Debug for MutableSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableSnapshot")
            .field("id", &self.inner.id)
            .field("writes", &self.inner.writes.borrow().len())
            .field("status", &self.inner.status.get())
            .finish()
    }
}

/// Runs `f` in a fresh snapshot and applies it when `f` returns. A panic in
/// `f` discards every write it made.
pub fn run_in_mutable_snapshot<R>(f: impl FnOnce() -> R) -> R {
    let snapshot = MutableSnapshot::take();
    let result = snapshot.enter(f);
    snapshot.apply();
    result
}

fn current() -> Option<Rc<SnapshotInner>> {
    ACTIVE_SNAPSHOTS.with(|stack| stack.borrow().last().cloned())
}

/// True while some mutable snapshot is entered on this thread.
pub fn in_snapshot() -> bool {
    ACTIVE_SNAPSHOTS.with(|stack| !stack.borrow().is_empty())
}

/// Looks up the newest pending value for `id` across the active snapshots.
pub(crate) fn with_pending<R>(id: StateId, f: impl FnOnce(&dyn Any) -> R) -> Option<R> {
    let snapshots: Vec<Rc<SnapshotInner>> = ACTIVE_SNAPSHOTS.with(|stack| stack.borrow().clone());
    for snapshot in snapshots.iter().rev() {
        if let Some(index) = snapshot.find(id) {
            let writes = snapshot.writes.borrow();
            return Some(f(&*writes[index].value));
        }
    }
    None
}

/// Routes a write to the innermost snapshot. Returns the value back when no
/// snapshot is active so the caller can commit it directly.
pub(crate) fn record_write(state: StateHandle, value: Box<dyn Any>) -> Option<Box<dyn Any>> {
    match current() {
        Some(snapshot) => {
            snapshot.record(state, value);
            None
        }
        None => Some(value),
    }
}

/// Handle for an apply observer; unregisters when dropped.
pub struct ApplyObserverHandle {
    id: u64,
}

impl ApplyObserverHandle {
    pub fn dispose(self) {}
}

impl Drop for ApplyObserverHandle {
    fn drop(&mut self) {
        let id = self.id;
        APPLY_OBSERVERS.with(|observers| {
            if let Ok(mut observers) = observers.try_borrow_mut() {
                observers.retain(|(entry, _)| *entry != id);
            }
        });
    }
}

/// Registers `observer` for every batch of committed state changes on this
/// thread.
pub fn register_apply_observer(observer: impl Fn(&[StateHandle]) + 'static) -> ApplyObserverHandle {
    let id = NEXT_OBSERVER_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    });
    APPLY_OBSERVERS.with(|observers| observers.borrow_mut().push((id, Rc::new(observer))));
    ApplyObserverHandle { id }
}

/// Notifies apply observers that `modified` changed outside a snapshot.
pub(crate) fn notify_apply_observers(modified: &[StateHandle]) {
    let observers: Vec<ApplyObserver> = APPLY_OBSERVERS.with(|observers| {
        observers
            .borrow()
            .iter()
            .map(|(_, observer)| Rc::clone(observer))
            .collect()
    });
    for observer in observers {
        observer(modified);
    }
}

/// Identity of a state object, usable as a map key.
pub(crate) fn state_key(state: &StateHandle) -> PtrKey {
    PtrKey::of(state)
}
