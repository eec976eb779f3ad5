use super::*;
use crate::applier::TreeApplier;
use crate::composition::Composition;
use crate::platform::ManualScheduler;
use crate::state::MutableState;

#[derive(Default)]
struct CountingScheduler {
    requests: AtomicUsize,
}

impl RuntimeScheduler for CountingScheduler {
    fn schedule_frame(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

fn manual() -> Recomposer {
    Recomposer::new(Arc::new(ManualScheduler))
}

/// Content that reads `state` and counts its runs.
fn observing(recomposer: &Recomposer, state: &MutableState<i32>, runs: &Rc<Cell<usize>>) -> Composition<TreeApplier> {
    let mut composition = Composition::new(TreeApplier::new(), recomposer);
    let state = state.clone();
    let runs = Rc::clone(runs);
    composition
        .set_content(move || {
            runs.set(runs.get() + 1);
            state.get();
        })
        .expect("initial composition");
    composition
}

fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
    let mut cx = Context::from_waker(futures_task::noop_waker_ref());
    Pin::new(future).poll(&mut cx)
}

#[test]
fn state_write_schedules_a_frame_and_recomposes() {
    let scheduler = Arc::new(CountingScheduler::default());
    let recomposer = Recomposer::new(scheduler.clone());
    let state = MutableState::new(0);
    let runs = Rc::new(Cell::new(0));
    let _composition = observing(&recomposer, &state, &runs);
    assert_eq!(recomposer.state(), RecomposerState::Idle);

    state.set(1);

    assert!(scheduler.requests.load(Ordering::SeqCst) > 0);
    assert_eq!(recomposer.state(), RecomposerState::PendingWork);
    assert!(recomposer.needs_frame());
    assert_eq!(recomposer.run_frame(0), Ok(true));
    assert_eq!(runs.get(), 2);
    assert_eq!(recomposer.state(), RecomposerState::Idle);
    assert!(!recomposer.needs_frame());
}

#[test]
fn writes_in_one_snapshot_cause_one_pass() {
    let recomposer = manual();
    let first = MutableState::new(0);
    let second = MutableState::new(0);
    let runs = Rc::new(Cell::new(0));
    let mut composition = Composition::new(TreeApplier::new(), &recomposer);
    composition
        .set_content({
            let first = first.clone();
            let second = second.clone();
            let runs = Rc::clone(&runs);
            move || {
                runs.set(runs.get() + 1);
                first.get();
                second.get();
            }
        })
        .expect("initial composition");

    crate::run_in_mutable_snapshot(|| {
        first.set(1);
        second.set(1);
        assert!(!recomposer.has_pending_recompositions());
    });
    assert!(recomposer.has_pending_recompositions());

    recomposer.run_frame(0).expect("frame");
    assert_eq!(runs.get(), 2);
}

#[test]
fn frame_callbacks_run_before_recomposition() {
    let recomposer = manual();
    let state = MutableState::new(0);
    let runs = Rc::new(Cell::new(0));
    let _composition = observing(&recomposer, &state, &runs);
    let frame_time = Rc::new(Cell::new(0));

    let registration = recomposer.frame_clock().with_frame_nanos({
        let state = state.clone();
        let frame_time = Rc::clone(&frame_time);
        move |nanos| {
            frame_time.set(nanos);
            state.set(7);
        }
    });
    registration.detach();
    assert!(recomposer.has_pending_work());

    recomposer.run_frame(16_000_000).expect("frame");

    assert_eq!(frame_time.get(), 16_000_000);
    assert_eq!(runs.get(), 2);
    assert_eq!(recomposer.state(), RecomposerState::Idle);
}

#[test]
fn dropped_frame_registration_is_cancelled() {
    let recomposer = manual();
    let fired = Rc::new(Cell::new(false));
    {
        let fired = Rc::clone(&fired);
        let _registration = recomposer.frame_clock().with_frame_millis(move |_| fired.set(true));
    }
    recomposer.run_frame(0).expect("frame");
    assert!(!fired.get());
}

#[test]
fn passes_per_frame_are_bounded() {
    let recomposer = Recomposer::with_options(
        Arc::new(ManualScheduler),
        RecomposerOptions {
            max_passes_per_frame: 3,
        },
    );
    let state = MutableState::new(0);
    let runs = Rc::new(Cell::new(0));
    let mut composition = Composition::new(TreeApplier::new(), &recomposer);
    composition
        .set_content({
            let state = state.clone();
            let runs = Rc::clone(&runs);
            move || {
                runs.set(runs.get() + 1);
                let value = state.get();
                if value < 100 {
                    state.set(value + 1);
                }
            }
        })
        .expect("initial composition");
    assert_eq!(runs.get(), 1);

    recomposer.run_frame(0).expect("first frame");

    assert_eq!(runs.get(), 4);
    assert!(recomposer.needs_frame());
    assert_eq!(recomposer.state(), RecomposerState::PendingWork);
}

#[test]
fn failed_pass_keeps_work_pending_and_recovers() {
    let recomposer = manual();
    let state = MutableState::new(0);
    let fail = Rc::new(Cell::new(true));
    let mut composition = Composition::new(TreeApplier::new(), &recomposer);
    composition
        .set_content({
            let state = state.clone();
            let fail = Rc::clone(&fail);
            move || {
                if state.get() > 0 && fail.get() {
                    panic!("cannot render {}", state.get_untracked());
                }
            }
        })
        .expect("initial composition");

    state.set(1);
    let error = recomposer.run_frame(0).expect_err("failing pass");
    assert_eq!(
        error,
        ComposeError::Panicked {
            message: "cannot render 1".to_string()
        }
    );
    assert_eq!(recomposer.state(), RecomposerState::PendingWork);
    assert!(composition.has_invalidations());

    fail.set(false);
    assert_eq!(recomposer.run_frame(0), Ok(true));
    assert_eq!(recomposer.state(), RecomposerState::Idle);
}

#[test]
fn recompose_scope_now_runs_synchronously() {
    let recomposer = manual();
    let scope = Rc::new(RefCell::new(None));
    let runs = Rc::new(Cell::new(0));
    let mut composition = Composition::new(TreeApplier::new(), &recomposer);
    composition
        .set_content({
            let scope = Rc::clone(&scope);
            let runs = Rc::clone(&runs);
            move || {
                runs.set(runs.get() + 1);
                *scope.borrow_mut() = crate::current_recompose_scope();
            }
        })
        .expect("initial composition");
    let captured = scope.borrow().clone().expect("content scope");

    assert_eq!(recomposer.recompose_scope_now(&captured), Ok(true));
    assert_eq!(runs.get(), 2);
    assert!(!recomposer.has_pending_recompositions());
}

#[test]
fn spawned_task_resumes_on_next_frame() {
    let recomposer = manual();
    let seen = Rc::new(Cell::new(None));
    let clock = recomposer.frame_clock();
    let handle = recomposer
        .spawn({
            let seen = Rc::clone(&seen);
            async move {
                let nanos = clock.next_frame().await;
                seen.set(Some(nanos));
            }
        })
        .expect("recomposer accepts tasks");
    assert!(handle.is_active());

    recomposer.run_frame(42).expect("frame");

    assert_eq!(seen.get(), Some(42));
    assert!(!handle.is_active());
}

#[test]
fn cancelled_task_is_dropped() {
    let recomposer = manual();
    let handle = recomposer
        .spawn(std::future::pending::<()>())
        .expect("recomposer accepts tasks");
    assert!(handle.is_active());
    let id = handle.id();

    handle.cancel();

    assert!(!recomposer.inner.is_task_active(id));
    assert!(!recomposer.run_tasks());
}

#[test]
fn close_waits_for_running_tasks() {
    let recomposer = manual();
    let clock = recomposer.frame_clock();
    recomposer
        .spawn(async move {
            clock.next_frame().await;
        })
        .expect("recomposer accepts tasks");
    recomposer.run_tasks();

    recomposer.close();
    assert_eq!(recomposer.state(), RecomposerState::ShuttingDown);
    assert!(recomposer.spawn(async {}).is_none());
    assert_eq!(recomposer.recompose_pending(), Err(ComposeError::ShutDown));

    recomposer.run_frame(1).expect("draining frame");
    assert_eq!(recomposer.state(), RecomposerState::ShutDown);
}

#[test]
fn cancel_shuts_down_immediately() {
    let recomposer = manual();
    recomposer
        .spawn(std::future::pending::<()>())
        .expect("recomposer accepts tasks");

    let mut join = recomposer.join();
    assert!(poll_once(&mut join).is_pending());

    recomposer.cancel();

    assert_eq!(recomposer.state(), RecomposerState::ShutDown);
    assert_eq!(poll_once(&mut join), Poll::Ready(RecomposerState::ShutDown));
    assert_eq!(recomposer.run_frame(0), Ok(false));
}

#[test]
fn await_idle_resolves_after_pending_work() {
    let recomposer = manual();
    let state = MutableState::new(0);
    let runs = Rc::new(Cell::new(0));
    let _composition = observing(&recomposer, &state, &runs);
    state.set(3);

    let mut idle = recomposer.await_idle();
    assert!(poll_once(&mut idle).is_pending());

    recomposer.run_frame(0).expect("frame");
    assert_eq!(poll_once(&mut idle), Poll::Ready(RecomposerState::Idle));
}

#[test]
fn dispatcher_runs_tasks_posted_from_other_threads() {
    let recomposer = manual();
    let dispatcher = recomposer.dispatcher();
    let counter = Arc::new(AtomicUsize::new(0));

    let worker = {
        let counter = Arc::clone(&counter);
        std::thread::spawn(move || {
            dispatcher.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        })
    };
    worker.join().expect("worker thread");

    assert!(recomposer.dispatcher().has_pending());
    assert_eq!(recomposer.state(), RecomposerState::PendingWork);
    recomposer.run_frame(0).expect("frame");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(!recomposer.dispatcher().has_pending());
}

#[test]
fn dropped_compositions_are_not_counted() {
    let recomposer = manual();
    let first = Composition::new(TreeApplier::new(), &recomposer);
    let second = Composition::new(TreeApplier::new(), &recomposer);
    assert_eq!(recomposer.composition_count(), 2);
    assert_ne!(first.id(), second.id());

    drop(first);
    assert_eq!(recomposer.composition_count(), 1);
}

#[test]
fn states_are_ordered_from_gone_to_busy() {
    assert!(RecomposerState::ShutDown < RecomposerState::ShuttingDown);
    assert!(RecomposerState::ShuttingDown < RecomposerState::Idle);
    assert!(RecomposerState::Idle < RecomposerState::PendingWork);
    assert!(RecomposerState::PendingWork < RecomposerState::RecomposeInProgress);
    assert_eq!(RecomposerOptions::default().max_passes_per_frame, 8);
}
