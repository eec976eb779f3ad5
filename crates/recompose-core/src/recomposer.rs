//! Drives recomposition: coalesces invalidated compositions into passes at
//! frame boundaries, runs frame callbacks and polls effect tasks.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::task::{Context, Poll, Waker};

use crate::collections::map::HashSet;
use crate::composition::{CompositionId, ControlledComposition};
use crate::frame_clock::FrameClock;
use crate::platform::RuntimeScheduler;
use crate::scope::RecomposeScope;
use crate::snapshot::{self, ApplyObserverHandle, StateHandle};
use crate::ComposeError;

pub type FrameCallbackId = u64;
pub type TaskId = u64;

/// Lifecycle of a [`Recomposer`], ordered from "gone" to "busy".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecomposerState {
    /// Closed or cancelled; no further passes or tasks run.
    ShutDown,
    /// Closed, waiting for running effect tasks to finish.
    ShuttingDown,
    /// Nothing to do until something is invalidated.
    Idle,
    /// Invalidations, frame callbacks or tasks are waiting for a frame.
    PendingWork,
    /// A composition pass is running.
    RecomposeInProgress,
}

#[derive(Clone, Debug)]
pub struct RecomposerOptions {
    /// Back-to-back passes one `run_frame` may perform while passes keep
    /// producing invalidations.
    pub max_passes_per_frame: usize,
}

impl Default for RecomposerOptions {
    fn default() -> Self {
        Self {
            max_passes_per_frame: 8,
        }
    }
}

type UiTask = Box<dyn FnOnce() + Send + 'static>;

struct UiDispatcherInner {
    scheduler: Arc<dyn RuntimeScheduler>,
    tx: mpsc::Sender<UiTask>,
    pending: AtomicUsize,
}

impl UiDispatcherInner {
    fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Box::new(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.scheduler.schedule_frame();
    }

    fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

struct PendingGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let previous = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "more UI tasks finished than were posted");
    }
}

/// Sends work to the recomposer's thread from any thread. Posted tasks run
/// at the start of the next frame.
#[derive(Clone)]
pub struct UiDispatcher {
    inner: Arc<UiDispatcherInner>,
}

impl UiDispatcher {
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.post(task);
    }

    pub fn has_pending(&self) -> bool {
        self.inner.has_pending()
    }
}

struct TaskEntry {
    id: TaskId,
    future: Pin<Box<dyn Future<Output = ()> + 'static>>,
}

struct FrameCallbackEntry {
    id: FrameCallbackId,
    callback: Box<dyn FnOnce(u64) + 'static>,
}

struct RecomposerInner {
    scheduler: Arc<dyn RuntimeScheduler>,
    options: RecomposerOptions,
    needs_frame: Cell<bool>,
    recomposing: Cell<bool>,
    closing: Cell<bool>,
    shut_down: Cell<bool>,
    compositions: RefCell<Vec<(CompositionId, Weak<dyn ControlledComposition>)>>,
    pending: RefCell<Vec<CompositionId>>,
    frame_callbacks: RefCell<VecDeque<FrameCallbackEntry>>,
    next_frame_callback_id: Cell<FrameCallbackId>,
    ui_dispatcher: Arc<UiDispatcherInner>,
    ui_rx: RefCell<mpsc::Receiver<UiTask>>,
    local_tasks: RefCell<VecDeque<Box<dyn FnOnce() + 'static>>>,
    tasks: RefCell<Vec<TaskEntry>>,
    cancelled: RefCell<HashSet<TaskId>>,
    next_task_id: Cell<TaskId>,
    task_waker: Waker,
    woken: Arc<AtomicBool>,
    state_wakers: RefCell<Vec<Waker>>,
    apply_observer: RefCell<Option<ApplyObserverHandle>>,
}

impl RecomposerInner {
    fn request_frame(&self) {
        self.needs_frame.set(true);
        self.scheduler.schedule_frame();
    }

    fn schedule(&self, id: CompositionId) {
        if self.shut_down.get() {
            return;
        }
        {
            let mut pending = self.pending.borrow_mut();
            if !pending.contains(&id) {
                pending.push(id);
            }
        }
        self.request_frame();
    }

    fn composition(&self, id: CompositionId) -> Option<Rc<dyn ControlledComposition>> {
        self.compositions
            .borrow()
            .iter()
            .find(|(entry, _)| *entry == id)
            .and_then(|(_, weak)| weak.upgrade())
    }

    fn live_compositions(&self) -> Vec<Rc<dyn ControlledComposition>> {
        let mut compositions = self.compositions.borrow_mut();
        compositions.retain(|(_, weak)| weak.strong_count() > 0);
        compositions.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    fn unregister(&self, id: CompositionId) {
        self.compositions.borrow_mut().retain(|(entry, _)| *entry != id);
        self.pending.borrow_mut().retain(|entry| *entry != id);
    }

    fn invalidate_states(&self, states: &[StateHandle]) {
        for composition in self.live_compositions() {
            composition.invalidate_states(states);
        }
    }

    fn has_pending_work(&self) -> bool {
        !self.pending.borrow().is_empty()
            || !self.frame_callbacks.borrow().is_empty()
            || !self.local_tasks.borrow().is_empty()
            || self.ui_dispatcher.has_pending()
            || self.woken.load(Ordering::SeqCst)
    }

    fn state(&self) -> RecomposerState {
        if self.shut_down.get() {
            RecomposerState::ShutDown
        } else if self.closing.get() {
            RecomposerState::ShuttingDown
        } else if self.recomposing.get() {
            RecomposerState::RecomposeInProgress
        } else if self.has_pending_work() {
            RecomposerState::PendingWork
        } else {
            RecomposerState::Idle
        }
    }

    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + 'static>>) -> Option<TaskId> {
        if self.closing.get() || self.shut_down.get() {
            return None;
        }
        let id = self.next_task_id.get();
        self.next_task_id.set(id + 1);
        self.tasks.borrow_mut().push(TaskEntry { id, future });
        self.woken.store(true, Ordering::SeqCst);
        self.request_frame();
        Some(id)
    }

    fn cancel_task(&self, id: TaskId) {
        let removed = {
            let mut tasks = self.tasks.borrow_mut();
            let before = tasks.len();
            tasks.retain(|entry| entry.id != id);
            before != tasks.len()
        };
        if !removed {
            // The task may be in the middle of being polled.
            self.cancelled.borrow_mut().insert(id);
        }
    }

    fn is_task_active(&self, id: TaskId) -> bool {
        !self.cancelled.borrow().contains(&id) && self.tasks.borrow().iter().any(|entry| entry.id == id)
    }

    fn poll_tasks(&self) -> bool {
        self.woken.store(false, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        if tasks.is_empty() {
            return false;
        }
        let mut cx = Context::from_waker(&self.task_waker);
        let mut pending = Vec::with_capacity(tasks.len());
        let mut progressed = false;
        for mut entry in tasks {
            if self.cancelled.borrow().contains(&entry.id) {
                continue;
            }
            match entry.future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => progressed = true,
                Poll::Pending => pending.push(entry),
            }
        }
        let mut cancelled = self.cancelled.borrow_mut();
        pending.retain(|entry| !cancelled.contains(&entry.id));
        cancelled.clear();
        drop(cancelled);
        self.tasks.borrow_mut().extend(pending);
        progressed
    }

    fn drain_ui(&self) -> bool {
        let mut ran = false;
        loop {
            let mut executed = false;
            loop {
                let message = self.ui_rx.borrow().try_recv();
                match message {
                    Ok(task) => {
                        executed = true;
                        let _guard = PendingGuard {
                            counter: &self.ui_dispatcher.pending,
                        };
                        task();
                    }
                    Err(_) => break,
                }
            }
            loop {
                let task = self.local_tasks.borrow_mut().pop_front();
                match task {
                    Some(task) => {
                        executed = true;
                        task();
                    }
                    None => break,
                }
            }
            if self.poll_tasks() {
                executed = true;
            }
            if !executed {
                break;
            }
            ran = true;
        }
        ran
    }

    fn register_frame_callback(&self, callback: Box<dyn FnOnce(u64) + 'static>) -> Option<FrameCallbackId> {
        if self.shut_down.get() {
            return None;
        }
        let id = self.next_frame_callback_id.get();
        self.next_frame_callback_id.set(id + 1);
        self.frame_callbacks
            .borrow_mut()
            .push_back(FrameCallbackEntry { id, callback });
        self.request_frame();
        Some(id)
    }

    fn cancel_frame_callback(&self, id: FrameCallbackId) {
        self.frame_callbacks.borrow_mut().retain(|entry| entry.id != id);
    }

    fn drain_frame_callbacks(&self, frame_time_nanos: u64) {
        let callbacks: Vec<FrameCallbackEntry> = self.frame_callbacks.borrow_mut().drain(..).collect();
        for entry in callbacks {
            (entry.callback)(frame_time_nanos);
        }
    }

    fn recompose_pending(&self) -> Result<bool, ComposeError> {
        let mut recomposed = false;
        let mut first_error = None;
        for _ in 0..self.options.max_passes_per_frame.max(1) {
            let batch = std::mem::take(&mut *self.pending.borrow_mut());
            if batch.is_empty() {
                break;
            }
            self.recomposing.set(true);
            for id in batch {
                let Some(composition) = self.composition(id) else {
                    continue;
                };
                if composition.is_disposed() {
                    continue;
                }
                match composition.recompose() {
                    Ok(changed) => recomposed |= changed,
                    Err(error) => {
                        log::warn!("recomposing composition {id} failed: {error}");
                        self.schedule(id);
                        first_error.get_or_insert(error);
                    }
                }
            }
            self.recomposing.set(false);
            if first_error.is_some() {
                break;
            }
        }
        if !self.pending.borrow().is_empty() {
            self.request_frame();
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(recomposed),
        }
    }

    fn settle(&self) {
        if self.closing.get() && self.tasks.borrow().is_empty() {
            log::debug!("recomposer shut down");
            self.closing.set(false);
            self.shut_down.set(true);
        }
        if !self.has_pending_work() {
            self.needs_frame.set(false);
        }
        let state = self.state();
        if state <= RecomposerState::Idle {
            let wakers = std::mem::take(&mut *self.state_wakers.borrow_mut());
            for waker in wakers {
                waker.wake();
            }
        }
    }

    fn shut_down_now(&self) {
        self.closing.set(false);
        self.shut_down.set(true);
        self.tasks.borrow_mut().clear();
        self.local_tasks.borrow_mut().clear();
        self.frame_callbacks.borrow_mut().clear();
        self.pending.borrow_mut().clear();
        self.needs_frame.set(false);
    }
}

struct RecomposerTaskWaker {
    scheduler: Arc<dyn RuntimeScheduler>,
    woken: Arc<AtomicBool>,
}

impl futures_task::ArcWake for RecomposerTaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
        arc_self.scheduler.schedule_frame();
    }
}

/// Owns the scheduling of every composition created against it.
///
/// The host calls [`run_frame`](Self::run_frame) whenever its
/// [`RuntimeScheduler`] asks for a frame.
pub struct Recomposer {
    inner: Rc<RecomposerInner>,
}

impl Recomposer {
    pub fn new(scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        Self::with_options(scheduler, RecomposerOptions::default())
    }

    pub fn with_options(scheduler: Arc<dyn RuntimeScheduler>, options: RecomposerOptions) -> Self {
        let (tx, rx) = mpsc::channel();
        let woken = Arc::new(AtomicBool::new(false));
        let task_waker = futures_task::waker(Arc::new(RecomposerTaskWaker {
            scheduler: Arc::clone(&scheduler),
            woken: Arc::clone(&woken),
        }));
        let inner = Rc::new(RecomposerInner {
            ui_dispatcher: Arc::new(UiDispatcherInner {
                scheduler: Arc::clone(&scheduler),
                tx,
                pending: AtomicUsize::new(0),
            }),
            scheduler,
            options,
            needs_frame: Cell::new(false),
            recomposing: Cell::new(false),
            closing: Cell::new(false),
            shut_down: Cell::new(false),
            compositions: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
            frame_callbacks: RefCell::new(VecDeque::new()),
            next_frame_callback_id: Cell::new(1),
            ui_rx: RefCell::new(rx),
            local_tasks: RefCell::new(VecDeque::new()),
            tasks: RefCell::new(Vec::new()),
            cancelled: RefCell::new(HashSet::default()),
            next_task_id: Cell::new(1),
            task_waker,
            woken,
            state_wakers: RefCell::new(Vec::new()),
            apply_observer: RefCell::new(None),
        });
        let weak = Rc::downgrade(&inner);
        let observer = snapshot::register_apply_observer(move |states| {
            if let Some(inner) = weak.upgrade() {
                inner.invalidate_states(states);
            }
        });
        *inner.apply_observer.borrow_mut() = Some(observer);
        Self { inner }
    }

    pub fn handle(&self) -> RecomposerHandle {
        RecomposerHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn options(&self) -> &RecomposerOptions {
        &self.inner.options
    }

    pub fn state(&self) -> RecomposerState {
        self.inner.state()
    }

    pub fn has_pending_work(&self) -> bool {
        self.inner.has_pending_work()
    }

    /// True when the host should call [`run_frame`](Self::run_frame).
    pub fn needs_frame(&self) -> bool {
        self.inner.needs_frame.get() || self.inner.has_pending_work()
    }

    pub fn frame_clock(&self) -> FrameClock {
        FrameClock::new(self.handle())
    }

    pub fn dispatcher(&self) -> UiDispatcher {
        UiDispatcher {
            inner: Arc::clone(&self.inner.ui_dispatcher),
        }
    }

    /// Number of compositions still alive and registered.
    pub fn composition_count(&self) -> usize {
        self.inner.live_compositions().len()
    }

    /// Runs one frame: posted tasks, frame callbacks, then recomposition of
    /// every invalidated composition, then effect tasks.
    ///
    /// Returns whether any composition changed. A failing composition keeps
    /// its invalidations and the first failure is returned after the other
    /// compositions have had their pass.
    pub fn run_frame(&self, frame_time_nanos: u64) -> Result<bool, ComposeError> {
        let inner = &self.inner;
        if inner.shut_down.get() {
            return Ok(false);
        }
        inner.needs_frame.set(false);
        inner.drain_ui();
        inner.drain_frame_callbacks(frame_time_nanos);
        let result = if inner.closing.get() {
            Ok(false)
        } else {
            inner.recompose_pending()
        };
        inner.drain_ui();
        inner.settle();
        log::trace!("frame at {frame_time_nanos}ns finished in state {:?}", inner.state());
        result
    }

    /// Recomposes every invalidated composition without running frame
    /// callbacks.
    pub fn recompose_pending(&self) -> Result<bool, ComposeError> {
        if self.inner.shut_down.get() || self.inner.closing.get() {
            return Err(ComposeError::ShutDown);
        }
        let result = self.inner.recompose_pending();
        self.inner.settle();
        result
    }

    /// Runs posted tasks and polls effect tasks without starting a frame.
    /// Returns whether anything ran.
    pub fn run_tasks(&self) -> bool {
        if self.inner.shut_down.get() {
            return false;
        }
        let ran = self.inner.drain_ui();
        self.inner.settle();
        ran
    }

    /// True when some composition is waiting for a pass.
    pub fn has_pending_recompositions(&self) -> bool {
        !self.inner.pending.borrow().is_empty()
    }

    /// Invalidates `scope` and recomposes its composition right away.
    pub fn recompose_scope_now(&self, scope: &RecomposeScope) -> Result<bool, ComposeError> {
        if self.inner.shut_down.get() || self.inner.closing.get() {
            return Err(ComposeError::ShutDown);
        }
        let Some(state) = scope.composition() else {
            return Ok(false);
        };
        scope.invalidate();
        let id = state.id();
        self.inner.pending.borrow_mut().retain(|entry| *entry != id);
        let Some(composition) = self.inner.composition(id) else {
            return Err(ComposeError::Disposed);
        };
        self.inner.recomposing.set(true);
        let result = composition.recompose();
        self.inner.recomposing.set(false);
        if result.is_err() {
            self.inner.schedule(id);
        }
        self.inner.settle();
        result
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> Option<TaskHandle> {
        self.handle().spawn(future)
    }

    /// Stops accepting work. Running tasks are polled until they finish,
    /// after which the state becomes [`RecomposerState::ShutDown`].
    pub fn close(&self) {
        if self.inner.shut_down.get() {
            return;
        }
        log::debug!("recomposer closing");
        self.inner.closing.set(true);
        self.inner.pending.borrow_mut().clear();
        self.inner.settle();
    }

    /// Shuts down immediately, dropping every task and frame callback.
    pub fn cancel(&self) {
        log::debug!("recomposer cancelled");
        self.inner.shut_down_now();
        self.inner.settle();
    }

    /// Resolves once the recomposer is idle or shut down.
    pub fn await_idle(&self) -> StateFuture {
        StateFuture {
            inner: Rc::downgrade(&self.inner),
            target: RecomposerState::Idle,
        }
    }

    /// Resolves once the recomposer has shut down.
    pub fn join(&self) -> StateFuture {
        StateFuture {
            inner: Rc::downgrade(&self.inner),
            target: RecomposerState::ShutDown,
        }
    }
}

impl Drop for Recomposer {
    fn drop(&mut self) {
        if let Some(observer) = self.inner.apply_observer.borrow_mut().take() {
            observer.dispose();
        }
    }
}

impl fmt::Debug for Recomposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recomposer")
            .field("state", &self.state())
            .field("pending", &self.inner.pending.borrow().len())
            .field("tasks", &self.inner.tasks.borrow().len())
            .finish()
    }
}

/// Future returned by [`Recomposer::await_idle`] and [`Recomposer::join`].
pub struct StateFuture {
    inner: Weak<RecomposerInner>,
    target: RecomposerState,
}

impl Future for StateFuture {
    type Output = RecomposerState;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(inner) = self.inner.upgrade() else {
            return Poll::Ready(RecomposerState::ShutDown);
        };
        let state = inner.state();
        if state <= self.target {
            return Poll::Ready(state);
        }
        inner.state_wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

/// Weak reference to a [`Recomposer`]; every operation is a no-op once the
/// recomposer is gone.
#[derive(Clone, Default)]
pub struct RecomposerHandle {
    inner: Weak<RecomposerInner>,
}

impl RecomposerHandle {
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn state(&self) -> RecomposerState {
        self.inner
            .upgrade()
            .map_or(RecomposerState::ShutDown, |inner| inner.state())
    }

    pub(crate) fn schedule(&self, id: CompositionId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.schedule(id);
        }
    }

    pub(crate) fn unregister(&self, id: CompositionId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unregister(id);
        }
    }

    pub(crate) fn register(&self, id: CompositionId, composition: Weak<dyn ControlledComposition>) {
        match self.inner.upgrade() {
            Some(inner) => inner.compositions.borrow_mut().push((id, composition)),
            None => log::warn!("composition {id} created after its recomposer was dropped"),
        }
    }

    /// Requests a frame from the host scheduler.
    pub fn request_frame(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.request_frame();
        }
    }

    /// Queues a closure for the start of the next frame.
    pub fn enqueue_task(&self, task: impl FnOnce() + 'static) {
        if let Some(inner) = self.inner.upgrade() {
            inner.local_tasks.borrow_mut().push_back(Box::new(task));
            inner.request_frame();
        }
    }

    /// Spawns `future` on the recomposer's executor. Returns `None` when the
    /// recomposer is gone or closing.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> Option<TaskHandle> {
        let inner = self.inner.upgrade()?;
        let id = inner.spawn(Box::pin(future))?;
        Some(TaskHandle {
            id,
            recomposer: self.clone(),
        })
    }

    pub(crate) fn cancel_task(&self, id: TaskId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel_task(id);
        }
    }

    pub fn register_frame_callback(&self, callback: impl FnOnce(u64) + 'static) -> Option<FrameCallbackId> {
        self.inner
            .upgrade()?
            .register_frame_callback(Box::new(callback))
    }

    pub fn cancel_frame_callback(&self, id: FrameCallbackId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel_frame_callback(id);
        }
    }

    pub fn frame_clock(&self) -> FrameClock {
        FrameClock::new(self.clone())
    }
}

impl fmt::Debug for RecomposerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomposerHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A spawned effect task. Dropping the handle leaves the task running;
/// [`cancel`](Self::cancel) drops its future.
pub struct TaskHandle {
    id: TaskId,
    recomposer: RecomposerHandle,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.recomposer
            .inner
            .upgrade()
            .is_some_and(|inner| inner.is_task_active(self.id))
    }

    pub fn cancel(self) {
        self.recomposer.cancel_task(self.id);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
#[path = "tests/recomposer_tests.rs"]
mod tests;
