//! Side effects tied to the composition lifecycle.

use std::cell::RefCell;
use std::hash::Hash;

use crate::composer_context::with_composer;
use crate::remember::RememberObserver;
use crate::{hash_key, Key};

/// Runs `effect` after the current pass has been applied, on every pass that
/// executes this call.
#[allow(non_snake_case)]
pub fn SideEffect(effect: impl FnOnce() + 'static) {
    with_composer(|composer| composer.register_side_effect(effect));
}

/// Receiver of a [`DisposableEffect!`](crate::DisposableEffect) body.
pub struct DisposableEffectScope {
    _private: (),
}

impl DisposableEffectScope {
    pub fn on_dispose(&self, cleanup: impl FnOnce() + 'static) -> DisposableEffectResult {
        DisposableEffectResult::new(cleanup)
    }
}

#[derive(Default)]
pub struct DisposableEffectResult {
    cleanup: Option<Box<dyn FnOnce()>>,
}

impl DisposableEffectResult {
    pub fn new(cleanup: impl FnOnce() + 'static) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }
}

type DisposableBody = Box<dyn FnOnce(&DisposableEffectScope) -> DisposableEffectResult>;

struct DisposableEffectState {
    effect: RefCell<Option<DisposableBody>>,
    cleanup: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl RememberObserver for DisposableEffectState {
    fn on_remembered(&self) {
        let effect = self.effect.borrow_mut().take();
        if let Some(effect) = effect {
            let result = effect(&DisposableEffectScope { _private: () });
            *self.cleanup.borrow_mut() = result.cleanup;
        }
    }

    fn on_forgotten(&self) {
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

#[doc(hidden)]
pub fn __disposable_effect_impl<K, F>(group_key: Key, keys: K, effect: F)
where
    K: Hash,
    F: FnOnce(&DisposableEffectScope) -> DisposableEffectResult + 'static,
{
    with_composer(|composer| {
        composer.with_group(group_key, || {
            let key_hash = hash_key(&keys);
            composer.remember_observer_with_key(&key_hash, || {
                let effect: DisposableBody = Box::new(effect);
                DisposableEffectState {
                    effect: RefCell::new(Some(effect)),
                    cleanup: RefCell::new(None),
                }
            });
        });
    });
}

/// Runs an effect when it enters the composition or its keys change, and
/// its `on_dispose` cleanup when it leaves or before it runs again.
///
/// ```ignore
/// DisposableEffect!(user_id, move |scope| {
///     let subscription = subscribe(user_id);
///     scope.on_dispose(move || subscription.close())
/// });
/// ```
#[macro_export]
macro_rules! DisposableEffect {
    ($keys:expr, $effect:expr) => {
        $crate::__disposable_effect_impl($crate::location_key(file!(), line!(), column!()), $keys, $effect)
    };
}
