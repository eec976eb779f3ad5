use super::{StdClock, StdRuntime, StdScheduler};
use recompose_core::{useState, Clock, Composition, MutableState, RecomposerState, RuntimeScheduler, TreeApplier};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn state_change_requests_a_frame_and_recomposes() {
    let runtime = StdRuntime::new();
    let mut composition = Composition::new(TreeApplier::new(), runtime.recomposer());
    let recompositions = Rc::new(Cell::new(0u32));
    let state_slot: Rc<RefCell<Option<MutableState<i32>>>> = Rc::default();

    composition
        .set_content({
            let recompositions = Rc::clone(&recompositions);
            let state_slot = Rc::clone(&state_slot);
            move || {
                recompositions.set(recompositions.get() + 1);
                let state = useState(|| 0);
                state.get();
                state_slot.borrow_mut().replace(state);
            }
        })
        .expect("initial composition");
    assert_eq!(recompositions.get(), 1);
    runtime.take_frame_request();

    let state = state_slot.borrow().clone().expect("state captured during composition");
    state.set(1);

    assert!(runtime.take_frame_request(), "state.set should request a frame");
    assert_eq!(runtime.state(), RecomposerState::PendingWork);
    runtime.run_frame().expect("frame");
    assert_eq!(recompositions.get(), 2, "state change should trigger recomposition");
    assert_eq!(runtime.state(), RecomposerState::Idle);
}

#[test]
fn frame_waker_is_called_for_every_request() {
    let scheduler = StdScheduler::new();
    let wakes = Arc::new(AtomicUsize::new(0));
    scheduler.set_frame_waker({
        let wakes = Arc::clone(&wakes);
        move || {
            wakes.fetch_add(1, Ordering::SeqCst);
        }
    });

    scheduler.schedule_frame();
    scheduler.schedule_frame();
    assert_eq!(wakes.load(Ordering::SeqCst), 2);
    assert!(scheduler.take_frame_request());
    assert!(!scheduler.take_frame_request());

    scheduler.clear_frame_waker();
    scheduler.schedule_frame();
    assert_eq!(wakes.load(Ordering::SeqCst), 2);
    assert!(scheduler.take_frame_request());
}

#[test]
fn run_until_idle_drains_frame_callbacks() {
    let runtime = StdRuntime::new();
    let seen = Rc::new(Cell::new(None));
    runtime
        .frame_clock()
        .with_frame_nanos({
            let seen = Rc::clone(&seen);
            move |nanos| seen.set(Some(nanos))
        })
        .detach();

    let frames = runtime.run_until_idle(10).expect("frames");

    assert_eq!(frames, 1);
    assert!(seen.get().is_some());
    assert!(!runtime.recomposer().needs_frame());
    assert_eq!(runtime.run_until_idle(10), Ok(0));
}

#[test]
fn clock_and_frame_time_are_monotonic() {
    let clock = StdClock;
    let start = clock.now();
    let earlier = clock.elapsed_nanos(start);
    assert!(clock.elapsed_nanos(start) >= earlier);
    assert!(clock.elapsed(start).as_nanos() >= u128::from(earlier));

    let runtime = StdRuntime::default();
    let first = runtime.frame_time_nanos();
    let second = runtime.frame_time_nanos();
    assert!(second >= first);
}
