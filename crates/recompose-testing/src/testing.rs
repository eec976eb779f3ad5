use std::cell::{Ref, RefMut};
use std::sync::Arc;

use recompose_core::{
    ComposeError, Composition, ManualScheduler, NodeId, Operation, Recomposer, SlotTable, TreeApplier,
};

const MAX_PUMP_ROUNDS: usize = 100;

/// Headless harness for exercising compositions in tests.
///
/// Owns a [`Recomposer`] driven by hand and one composition over a
/// [`TreeApplier`], so tests can inspect the produced tree and the exact
/// edits applied to it.
pub struct ComposeTestRule {
    recomposer: Recomposer,
    composition: Composition<TreeApplier>,
    frame_time_nanos: u64,
    has_content: bool,
}

impl ComposeTestRule {
    /// Create a new test rule backed by a top-down [`TreeApplier`].
    pub fn new() -> Self {
        Self::with_applier(TreeApplier::new())
    }

    pub fn with_applier(applier: TreeApplier) -> Self {
        let recomposer = Recomposer::new(Arc::new(ManualScheduler));
        let composition = Composition::new(applier, &recomposer);
        Self {
            recomposer,
            composition,
            frame_time_nanos: 0,
            has_content: false,
        }
    }

    /// Install the provided content, compose it and settle any work the
    /// first pass produced.
    pub fn set_content(&mut self, content: impl Fn() + 'static) -> Result<(), ComposeError> {
        self.has_content = true;
        self.composition.set_content(content)?;
        self.pump_until_idle()
    }

    /// Run frame callbacks at `frame_time_nanos`, then settle.
    pub fn advance_frame(&mut self, frame_time_nanos: u64) -> Result<(), ComposeError> {
        self.frame_time_nanos = frame_time_nanos;
        self.recomposer.run_frame(frame_time_nanos)?;
        self.pump_until_idle()
    }

    /// Recompose invalidated scopes and run effect tasks until nothing is left
    /// to do. Frame callbacks stay queued for [`advance_frame`](Self::advance_frame).
    ///
    /// # Panics
    /// Panics when work keeps arriving after many rounds.
    pub fn pump_until_idle(&mut self) -> Result<(), ComposeError> {
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut progressed = self.recomposer.run_tasks();
            if self.recomposer.has_pending_recompositions() {
                self.recomposer.recompose_pending()?;
                progressed = true;
            }
            if !progressed {
                return Ok(());
            }
        }
        panic!("pump_until_idle did not settle after {MAX_PUMP_ROUNDS} rounds");
    }

    /// Re-run the whole content without skipping.
    pub fn force_recompose_all(&mut self) -> Result<(), ComposeError> {
        self.composition.force_recompose_all()?;
        self.pump_until_idle()
    }

    pub fn has_content(&self) -> bool {
        self.has_content
    }

    pub fn frame_time_nanos(&self) -> u64 {
        self.frame_time_nanos
    }

    pub fn recomposer(&self) -> &Recomposer {
        &self.recomposer
    }

    /// Gain mutable access to the raw composition for advanced scenarios.
    pub fn composition(&mut self) -> &mut Composition<TreeApplier> {
        &mut self.composition
    }

    pub fn root_id(&self) -> NodeId {
        self.composition.root()
    }

    /// Children of the root node, in order.
    pub fn root_children(&self) -> Vec<NodeId> {
        let root = self.composition.root();
        self.composition.applier().children(root).to_vec()
    }

    pub fn applier(&self) -> Ref<'_, TreeApplier> {
        self.composition.applier()
    }

    pub fn applier_mut(&mut self) -> RefMut<'_, TreeApplier> {
        self.composition.applier_mut()
    }

    /// Edits applied since the last call.
    pub fn take_operations(&mut self) -> Vec<Operation> {
        self.composition.applier_mut().take_operations()
    }

    pub fn slot_table(&self) -> std::rc::Rc<SlotTable> {
        self.composition.slot_table()
    }

    /// Dump the current node tree as text for debugging.
    pub fn dump_tree(&self) -> String {
        self.composition.applier().dump()
    }

    pub fn dispose(&mut self) -> Result<(), ComposeError> {
        self.composition.dispose()
    }
}

impl Default for ComposeTestRule {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience helper for tests that only need temporary access to a
/// `ComposeTestRule`.
pub fn run_test_composition<R>(f: impl FnOnce(&mut ComposeTestRule) -> R) -> R {
    let mut rule = ComposeTestRule::new();
    f(&mut rule)
}

#[cfg(test)]
#[path = "tests/testing_tests.rs"]
mod tests;
