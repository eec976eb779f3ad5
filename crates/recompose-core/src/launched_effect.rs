use std::cell::{Cell, RefCell};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::rc::Rc;

use crate::composer_context::with_composer;
use crate::frame_clock::{FrameClock, NextFrame};
use crate::recomposer::{RecomposerHandle, TaskHandle};
use crate::remember::RememberObserver;
use crate::{hash_key, Key};

type LaunchBody = Box<dyn FnOnce(LaunchedEffectScope) -> Pin<Box<dyn Future<Output = ()>>>>;

/// Handle given to a launched effect's future.
#[derive(Clone)]
pub struct LaunchedEffectScope {
    active: Rc<Cell<bool>>,
    recomposer: RecomposerHandle,
}

impl LaunchedEffectScope {
    /// False once the effect left the composition or its keys changed.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn recomposer(&self) -> RecomposerHandle {
        self.recomposer.clone()
    }

    pub fn frame_clock(&self) -> FrameClock {
        self.recomposer.frame_clock()
    }

    pub fn next_frame(&self) -> NextFrame {
        self.frame_clock().next_frame()
    }

    /// Queues `task` for the next frame; it is dropped if the effect is no
    /// longer active by then.
    pub fn post_ui(&self, task: impl FnOnce() + 'static) {
        if !self.is_active() {
            return;
        }
        let active = Rc::clone(&self.active);
        self.recomposer.enqueue_task(move || {
            if active.get() {
                task();
            }
        });
    }
}

struct LaunchedEffectState {
    recomposer: RecomposerHandle,
    launch: RefCell<Option<LaunchBody>>,
    active: Rc<Cell<bool>>,
    task: RefCell<Option<TaskHandle>>,
}

impl RememberObserver for LaunchedEffectState {
    fn on_remembered(&self) {
        let Some(launch) = self.launch.borrow_mut().take() else {
            return;
        };
        self.active.set(true);
        let scope = LaunchedEffectScope {
            active: Rc::clone(&self.active),
            recomposer: self.recomposer.clone(),
        };
        let future = launch(scope);
        let active = Rc::clone(&self.active);
        let task = self.recomposer.spawn(async move {
            future.await;
            active.set(false);
        });
        if task.is_none() {
            log::debug!("launched effect dropped: recomposer is not accepting tasks");
            self.active.set(false);
        }
        *self.task.borrow_mut() = task;
    }

    fn on_forgotten(&self) {
        self.active.set(false);
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            task.cancel();
        }
    }
}

#[doc(hidden)]
pub fn __launched_effect_impl<K, F, Fut>(group_key: Key, keys: K, effect: F)
where
    K: Hash,
    F: FnOnce(LaunchedEffectScope) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    with_composer(|composer| {
        composer.with_group(group_key, || {
            let key_hash = hash_key(&keys);
            let recomposer = composer.recomposer();
            composer.remember_observer_with_key(&key_hash, move || {
                let launch: LaunchBody =
                    Box::new(move |scope: LaunchedEffectScope| -> Pin<Box<dyn Future<Output = ()>>> {
                        Box::pin(effect(scope))
                    });
                LaunchedEffectState {
                    recomposer,
                    launch: RefCell::new(Some(launch)),
                    active: Rc::new(Cell::new(false)),
                    task: RefCell::new(None),
                }
            });
        });
    });
}

/// Launches a future on the recomposer when the effect enters the
/// composition. The task is cancelled (its future dropped) when the effect
/// leaves or its keys change, and relaunched for the new keys.
///
/// ```ignore
/// LaunchedEffect!(target, move |scope| async move {
///     while scope.is_active() {
///         let now = scope.next_frame().await;
///         animate(now);
///     }
/// });
/// ```
#[macro_export]
macro_rules! LaunchedEffect {
    ($keys:expr, $effect:expr) => {
        $crate::__launched_effect_impl($crate::location_key(file!(), line!(), column!()), $keys, $effect)
    };
}
