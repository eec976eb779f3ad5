use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::recomposer::{FrameCallbackId, RecomposerHandle};

/// Frame timing source for effects. Callbacks run at the start of the next
/// `Recomposer::run_frame`, before recomposition.
#[derive(Clone, Debug)]
pub struct FrameClock {
    recomposer: RecomposerHandle,
}

impl FrameClock {
    pub fn new(recomposer: RecomposerHandle) -> Self {
        Self { recomposer }
    }

    pub fn recomposer(&self) -> RecomposerHandle {
        self.recomposer.clone()
    }

    /// Runs `callback` with the next frame time in nanoseconds. Dropping the
    /// registration cancels it.
    pub fn with_frame_nanos(&self, callback: impl FnOnce(u64) + 'static) -> FrameCallbackRegistration {
        let id = self.recomposer.register_frame_callback(callback);
        FrameCallbackRegistration {
            recomposer: self.recomposer.clone(),
            id,
        }
    }

    pub fn with_frame_millis(&self, callback: impl FnOnce(u64) + 'static) -> FrameCallbackRegistration {
        self.with_frame_nanos(move |nanos| callback(nanos / 1_000_000))
    }

    /// Future resolving to the next frame time in nanoseconds.
    pub fn next_frame(&self) -> NextFrame {
        NextFrame {
            clock: self.clone(),
            state: Rc::new(RefCell::new(NextFrameState::default())),
        }
    }
}

#[must_use = "dropping the registration cancels the frame callback"]
pub struct FrameCallbackRegistration {
    recomposer: RecomposerHandle,
    id: Option<FrameCallbackId>,
}

impl FrameCallbackRegistration {
    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    pub fn cancel(mut self) {
        if let Some(id) = self.id.take() {
            self.recomposer.cancel_frame_callback(id);
        }
    }

    /// Keeps the callback registered after the registration is dropped.
    pub fn detach(mut self) {
        self.id = None;
    }
}

impl Drop for FrameCallbackRegistration {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.recomposer.cancel_frame_callback(id);
        }
    }
}

#[derive(Default)]
struct NextFrameState {
    registration: Option<FrameCallbackRegistration>,
    time: Option<u64>,
    waker: Option<Waker>,
}

pub struct NextFrame {
    clock: FrameClock,
    state: Rc<RefCell<NextFrameState>>,
}

impl Future for NextFrame {
    type Output = u64;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let registered = {
            let mut state = self.state.borrow_mut();
            if let Some(time) = state.time {
                return Poll::Ready(time);
            }
            state.waker = Some(cx.waker().clone());
            state.registration.is_some()
        };
        if !registered {
            let weak = Rc::downgrade(&self.state);
            let registration = self.clock.with_frame_nanos(move |time| {
                if let Some(state) = weak.upgrade() {
                    let waker = {
                        let mut state = state.borrow_mut();
                        state.time = Some(time);
                        if let Some(registration) = state.registration.take() {
                            registration.detach();
                        }
                        state.waker.take()
                    };
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }
            });
            self.state.borrow_mut().registration = Some(registration);
        }
        Poll::Pending
    }
}

impl Drop for NextFrame {
    fn drop(&mut self) {
        let registration = self.state.borrow_mut().registration.take();
        drop(registration);
    }
}
