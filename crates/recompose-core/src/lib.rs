#![doc = r"Slot table, composer and recomposer for a declarative tree composition runtime."]
#![allow(clippy::missing_const_for_thread_local)]

pub extern crate self as recompose_core;

pub mod applier;
pub mod changes;
pub mod collections;
pub mod composer;
pub mod composer_context;
pub mod composition;
mod effects;
mod error;
pub mod frame_clock;
pub mod hash;
mod launched_effect;
pub mod locals;
pub mod observer_map;
pub mod owned;
pub mod platform;
pub mod recomposer;
mod remember;
pub mod scope;
pub mod slot_table;
pub mod snapshot;
mod state;
pub mod subcompose;

use std::hash::Hash;

pub use applier::{Applier, AsAny, InsertOrder, Node, NodeUpdate, Operation, RootNode, TreeApplier};
pub use changes::{Change, ChangeList};
pub use composer::{Composer, Updater};
pub use composition::{Composition, CompositionId};
pub use effects::{
    DisposableEffectResult, DisposableEffectScope, SideEffect, __disposable_effect_impl,
};
pub use error::{ComposeError, NodeError, StructuralError};
pub use frame_clock::{FrameCallbackRegistration, FrameClock, NextFrame};
pub use launched_effect::{LaunchedEffectScope, __launched_effect_impl};
pub use locals::{composition_local_of, composition_local_provider, CompositionLocal, ProvidedValue};
pub use observer_map::ObserverMap;
pub use owned::Owned;
pub use platform::{Clock, ManualScheduler, RuntimeScheduler};
pub use recomposer::{
    Recomposer, RecomposerHandle, RecomposerOptions, RecomposerState, StateFuture, TaskHandle,
    UiDispatcher,
};
pub use remember::RememberObserver;
pub use scope::{InvalidationResult, RecomposeScope};
pub use slot_table::{Anchor, GroupKind, SlotTable};
pub use snapshot::{run_in_mutable_snapshot, MutableSnapshot, StateHandle, StateId, StateObject};
pub use state::{mutable_state_of, MutableState, State};
pub use subcompose::CompositionReference;

pub type Key = u64;
pub type NodeId = usize;

pub use composer_context::with_composer as with_current_composer;

/// Group key for a source location. Deterministic across runs and builds of
/// the same source tree.
pub fn location_key(file: &str, line: u32, column: u32) -> Key {
    let position = ((line as u64) << 32) | column as u64;
    hash::fnv1a(file.as_bytes()).rotate_left(17) ^ position.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

pub(crate) fn hash_key<K: Hash + ?Sized>(key: &K) -> Key {
    hash::hash_one(key)
}

pub fn remember<T: 'static>(init: impl FnOnce() -> T) -> Owned<T> {
    with_current_composer(|composer| composer.remember(init))
}

pub fn remember_with_key<K, T>(key: &K, init: impl FnOnce() -> T) -> Owned<T>
where
    K: PartialEq + Clone + 'static,
    T: 'static,
{
    with_current_composer(|composer| composer.remember_with_key(key, init))
}

/// Remembered state; the same `MutableState` is returned on every pass.
#[allow(non_snake_case)]
pub fn useState<T: Clone + PartialEq + 'static>(init: impl FnOnce() -> T) -> MutableState<T> {
    remember(|| mutable_state_of(init())).get()
}

/// Read-only state computed from the states `compute` reads.
///
/// `compute` runs whenever the calling scope runs, and the scope is
/// subscribed to everything `compute` reads. Readers of the returned state
/// are invalidated only when the computed value changes.
#[allow(non_snake_case)]
pub fn derivedStateOf<T: Clone + PartialEq + 'static>(compute: impl Fn() -> T) -> State<T> {
    with_current_composer(|composer| {
        let key = location_key(file!(), line!(), column!());
        composer.with_group(key, || {
            let mut created = false;
            let derived = composer.cache(false, || {
                created = true;
                mutable_state_of(compute())
            });
            if !created {
                derived.set(compute());
            }
            derived.as_state()
        })
    })
}

/// Reference to the current position for starting child compositions with
/// [`Composition::with_parent`].
pub fn composition_reference() -> CompositionReference {
    with_current_composer(|composer| composer.composition_reference())
}

pub fn with_key<K: Hash + ?Sized, R>(key: &K, content: impl FnOnce() -> R) -> R {
    with_current_composer(|composer| composer.with_key(key, content))
}

pub fn reusable_content<K: Hash + ?Sized, R>(key: &K, content: impl FnOnce() -> R) -> R {
    with_current_composer(|composer| composer.reusable_content(key, content))
}

pub fn emit<N: Node>(
    key: Key,
    factory: impl FnOnce() -> N + 'static,
    update: impl FnOnce(&mut Updater<'_, N>),
    content: impl FnOnce(),
) -> NodeId {
    with_current_composer(|composer| composer.emit(key, factory, update, content))
}

pub fn current_compound_key_hash() -> Key {
    with_current_composer(|composer| composer.current_compound_key_hash())
}

pub fn current_recompose_scope() -> Option<RecomposeScope> {
    composer_context::try_with_composer(|composer| composer.current_recompose_scope()).flatten()
}

#[allow(non_snake_case)]
pub fn CompositionLocalProvider(values: impl IntoIterator<Item = ProvidedValue>, content: impl FnOnce()) {
    composition_local_provider(values.into_iter().collect(), content)
}

#[allow(non_snake_case)]
pub fn withFrameNanos(callback: impl FnOnce(u64) + 'static) -> FrameCallbackRegistration {
    with_current_composer(|composer| composer.recomposer().frame_clock().with_frame_nanos(callback))
}
