//! Composition locals: values provided to a subtree without being passed
//! through every composable in between.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::collections::map::HashMap;
use crate::composer::PROVIDER_KEY;
use crate::composer_context;
use crate::state::MutableState;

pub type LocalKey = u64;

thread_local! {
    static NEXT_LOCAL_KEY: Cell<LocalKey> = const { Cell::new(1) };
}

/// Immutable map of provided locals. Providers derive a new context from the
/// enclosing one; scopes keep the context they started with.
#[derive(Clone, Default)]
pub struct LocalContext {
    values: Rc<HashMap<LocalKey, Rc<dyn Any>>>,
}

impl LocalContext {
    pub(crate) fn get(&self, key: LocalKey) -> Option<Rc<dyn Any>> {
        self.values.get(&key).cloned()
    }

    pub(crate) fn with_values(&self, values: Vec<(LocalKey, Rc<dyn Any>)>) -> LocalContext {
        let mut map = (*self.values).clone();
        map.extend(values);
        LocalContext {
            values: Rc::new(map),
        }
    }

    /// True when both contexts provide the same entries under the same keys.
    pub(crate) fn same_entries(&self, other: &LocalContext) -> bool {
        Rc::ptr_eq(&self.values, &other.values)
            || (self.values.len() == other.values.len()
                && self.values.iter().all(|(key, value)| {
                    other.values.get(key).is_some_and(|entry| Rc::ptr_eq(value, entry))
                }))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for LocalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

// Provided values live in state so readers below the provider are
// invalidated when the provided value changes.
struct LocalEntry<T: Clone + PartialEq + 'static> {
    state: MutableState<T>,
}

/// A key for a value provided through [`composition_local_provider`].
pub struct CompositionLocal<T> {
    key: LocalKey,
    default: Rc<dyn Fn() -> T>,
}

impl<T> Clone for CompositionLocal<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            default: Rc::clone(&self.default),
        }
    }
}

impl<T: Clone + PartialEq + 'static> CompositionLocal<T> {
    pub fn key(&self) -> LocalKey {
        self.key
    }

    pub fn provides(&self, value: T) -> ProvidedValue {
        let key = self.key;
        ProvidedValue {
            key,
            install: Box::new(move || {
                let entry = composer_context::with_composer(|composer| {
                    let initial = value.clone();
                    composer.cache(false, move || {
                        Rc::new(LocalEntry {
                            state: MutableState::new(initial),
                        })
                    })
                });
                entry.state.set(value);
                entry as Rc<dyn Any>
            }),
        }
    }

    /// Value provided by the nearest enclosing provider, or the default.
    /// Reading it subscribes the current scope to later changes.
    pub fn current(&self) -> T {
        let entry = composer_context::try_with_composer(|composer| composer.local_entry(self.key)).flatten();
        match entry.as_deref().and_then(|entry| entry.downcast_ref::<LocalEntry<T>>()) {
            Some(entry) => entry.state.get(),
            None => (self.default)(),
        }
    }
}

impl<T> fmt::Debug for CompositionLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositionLocal").field("key", &self.key).finish()
    }
}

/// Creates a local whose value is `default()` where nothing provides it.
pub fn composition_local_of<T: Clone + PartialEq + 'static>(default: impl Fn() -> T + 'static) -> CompositionLocal<T> {
    let key = NEXT_LOCAL_KEY.with(|next| {
        let key = next.get();
        next.set(key + 1);
        key
    });
    CompositionLocal {
        key,
        default: Rc::new(default),
    }
}

/// A value bound to a local, produced by [`CompositionLocal::provides`].
pub struct ProvidedValue {
    key: LocalKey,
    install: Box<dyn FnOnce() -> Rc<dyn Any>>,
}

/// Runs `content` with `values` provided to everything it composes.
pub fn composition_local_provider<R>(values: Vec<ProvidedValue>, content: impl FnOnce() -> R) -> R {
    composer_context::with_composer(|composer| {
        composer.start_group(PROVIDER_KEY);
        let entries: Vec<(LocalKey, Rc<dyn Any>)> = values
            .into_iter()
            .map(|provided| (provided.key, (provided.install)()))
            .collect();
        let result = composer.with_locals(entries, content);
        composer.end_group();
        result
    })
}

#[cfg(test)]
#[path = "tests/locals_tests.rs"]
mod tests;
