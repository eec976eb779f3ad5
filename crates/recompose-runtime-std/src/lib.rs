//! Host services for running a recomposer on a plain `std` thread.
//!
//! Implements the `recompose-core` platform traits with an atomic frame
//! flag and `std::time`. Applications construct a
//! [`StdRuntime`], create their compositions against
//! [`StdRuntime::recomposer`] and call [`StdRuntime::run_frame`] whenever
//! [`StdRuntime::take_frame_request`] reports a request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use recompose_core::{
    Clock, ComposeError, FrameClock, Recomposer, RecomposerHandle, RecomposerOptions, RecomposerState,
    RuntimeScheduler,
};

type FrameWaker = Arc<dyn Fn() + Send + Sync + 'static>;

/// Scheduler that records frame requests in an atomic flag and optionally
/// forwards them to a host waker (an event loop proxy, a condvar, ...).
pub struct StdScheduler {
    frame_requested: AtomicBool,
    frame_waker: RwLock<Option<FrameWaker>>,
}

impl StdScheduler {
    pub fn new() -> Self {
        Self {
            frame_requested: AtomicBool::new(false),
            frame_waker: RwLock::new(None),
        }
    }

    /// Consumes the pending frame request, if any.
    pub fn take_frame_request(&self) -> bool {
        self.frame_requested.swap(false, Ordering::SeqCst)
    }

    /// `waker` runs on every `schedule_frame`, from whichever thread called it.
    pub fn set_frame_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self.frame_waker.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(waker));
    }

    /// Stops forwarding frame requests.
    pub fn clear_frame_waker(&self) {
        *self.frame_waker.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn wake(&self) {
        let waker = self
            .frame_waker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(waker) = waker {
            waker();
        }
    }
}

impl Default for StdScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StdScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdScheduler")
            .field("frame_requested", &self.frame_requested.load(Ordering::SeqCst))
            .finish()
    }
}

impl RuntimeScheduler for StdScheduler {
    fn schedule_frame(&self) {
        self.frame_requested.store(true, Ordering::SeqCst);
        self.wake();
    }
}

/// Monotonic clock over [`Instant`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant::now()
    }

    fn elapsed_millis(&self, since: Self::Instant) -> u64 {
        since.elapsed().as_millis() as u64
    }

    fn elapsed_nanos(&self, since: Self::Instant) -> u64 {
        u64::try_from(since.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl StdClock {
    pub fn elapsed(&self, since: Instant) -> Duration {
        since.elapsed()
    }
}

/// Bundles a [`Recomposer`] with the standard scheduler and clock.
///
/// Frame times passed to the recomposer are nanoseconds since the runtime
/// was created.
pub struct StdRuntime {
    scheduler: Arc<StdScheduler>,
    clock: StdClock,
    started: Instant,
    recomposer: Recomposer,
}

impl StdRuntime {
    pub fn new() -> Self {
        Self::with_options(RecomposerOptions::default())
    }

    pub fn with_options(options: RecomposerOptions) -> Self {
        let scheduler = Arc::new(StdScheduler::new());
        let recomposer = Recomposer::with_options(scheduler.clone(), options);
        let clock = StdClock;
        Self {
            scheduler,
            started: clock.now(),
            clock,
            recomposer,
        }
    }

    /// The recomposer compositions should be created against.
    pub fn recomposer(&self) -> &Recomposer {
        &self.recomposer
    }

    pub fn handle(&self) -> RecomposerHandle {
        self.recomposer.handle()
    }

    /// Returns the recomposer's frame clock.
    pub fn frame_clock(&self) -> FrameClock {
        self.recomposer.frame_clock()
    }

    pub fn scheduler(&self) -> Arc<StdScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn clock(&self) -> &StdClock {
        &self.clock
    }

    pub fn state(&self) -> RecomposerState {
        self.recomposer.state()
    }

    /// See [`StdScheduler::take_frame_request`].
    pub fn take_frame_request(&self) -> bool {
        self.scheduler.take_frame_request()
    }

    pub fn set_frame_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        self.scheduler.set_frame_waker(waker);
    }

    pub fn clear_frame_waker(&self) {
        self.scheduler.clear_frame_waker();
    }

    /// Nanoseconds since the runtime was created.
    pub fn frame_time_nanos(&self) -> u64 {
        self.clock.elapsed_nanos(self.started)
    }

    /// Runs one frame stamped with the current time.
    pub fn run_frame(&self) -> Result<bool, ComposeError> {
        let now = self.frame_time_nanos();
        log::trace!("running frame at {now}ns");
        self.recomposer.run_frame(now)
    }

    /// Runs frames until the recomposer stops asking for one, at most
    /// `max_frames` times. Returns the number of frames run.
    pub fn run_until_idle(&self, max_frames: usize) -> Result<usize, ComposeError> {
        let mut frames = 0;
        while frames < max_frames && (self.take_frame_request() || self.recomposer.needs_frame()) {
            self.run_frame()?;
            frames += 1;
        }
        if frames == max_frames && self.recomposer.needs_frame() {
            log::debug!("still busy after {max_frames} frames");
        }
        Ok(frames)
    }
}

impl fmt::Debug for StdRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdRuntime")
            .field("scheduler", &self.scheduler)
            .field("recomposer", &self.recomposer)
            .finish()
    }
}

impl Default for StdRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/std_runtime_tests.rs"]
mod tests;
