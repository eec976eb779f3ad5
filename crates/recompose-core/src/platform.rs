//! Platform abstraction traits for the recompose runtime.
//!
//! The recomposer never sleeps or spawns threads itself. Hosts implement
//! these traits to learn when a frame is needed and to provide frame time.

/// Schedules work for the recomposer.
///
/// `schedule_frame` is called whenever new invalidations, frame callbacks or
/// woken tasks arrive. Implementations must be safe to call from any thread
/// because task wakers may fire off the UI thread.
pub trait RuntimeScheduler: Send + Sync {
    /// Request that the host call `Recomposer::run_frame` soon.
    fn schedule_frame(&self);
}

/// Provides timing information for frame driving.
pub trait Clock: Send + Sync {
    /// Instant type produced by this clock implementation.
    type Instant: Copy + Send + Sync;

    fn now(&self) -> Self::Instant;

    /// Milliseconds elapsed since `since`.
    fn elapsed_millis(&self, since: Self::Instant) -> u64;

    /// Nanoseconds elapsed since `since`, used as frame time.
    fn elapsed_nanos(&self, since: Self::Instant) -> u64 {
        self.elapsed_millis(since).saturating_mul(1_000_000)
    }
}

/// Scheduler that ignores frame requests. Hosts that drive frames in a loop
/// (tests, headless tools) poll `Recomposer::needs_frame` instead.
#[derive(Default, Debug, Clone, Copy)]
pub struct ManualScheduler;

impl RuntimeScheduler for ManualScheduler {
    fn schedule_frame(&self) {}
}
