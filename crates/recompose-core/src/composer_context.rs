use std::cell::RefCell;
use std::rc::Rc;

use crate::composer::{Composer, ComposerCore};

// Composers of the passes running on this thread, innermost last.
thread_local! {
    static COMPOSER_STACK: RefCell<Vec<Rc<ComposerCore>>> = const { RefCell::new(Vec::new()) };
}

/// Pops the composer stack on drop.
#[must_use = "ComposerScopeGuard pops the composer stack on drop"]
pub struct ComposerScopeGuard;

impl Drop for ComposerScopeGuard {
    fn drop(&mut self) {
        COMPOSER_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Makes `composer` current until the returned guard is dropped.
pub(crate) fn enter(composer: &Composer) -> ComposerScopeGuard {
    COMPOSER_STACK.with(|stack| {
        stack.borrow_mut().push(composer.clone_core());
    });
    ComposerScopeGuard
}

/// Runs `f` with the composer of the pass in progress.
///
/// # Panics
/// Panics when called outside of composition.
pub fn with_composer<R>(f: impl FnOnce(&Composer) -> R) -> R {
    try_with_composer(f).expect("composable called outside of composition")
}

/// Like [`with_composer`] but returns `None` outside of composition.
pub fn try_with_composer<R>(f: impl FnOnce(&Composer) -> R) -> Option<R> {
    let core = COMPOSER_STACK.with(|stack| stack.borrow().last().cloned())?;
    let composer = Composer::from_core(core);
    Some(f(&composer))
}

/// True while a pass is running on this thread.
pub fn is_composing() -> bool {
    COMPOSER_STACK.with(|stack| !stack.borrow().is_empty())
}
