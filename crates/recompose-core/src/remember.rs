use std::rc::Rc;

use crate::slot_table::SlotOrder;

/// Values that want to know when they enter or leave the composition.
///
/// Callbacks run after the pass that produced them has been applied:
/// `on_remembered` once the value is stored in a committed table,
/// `on_forgotten` once it has been dropped from one. A value remembered by a
/// pass that is later abandoned receives `on_abandoned` instead and never
/// sees the other two.
pub trait RememberObserver: 'static {
    fn on_remembered(&self);
    fn on_forgotten(&self);
    fn on_abandoned(&self) {}
}

/// Lifecycle work collected during a pass and dispatched after apply.
#[derive(Default)]
pub(crate) struct RememberManager {
    remembering: Vec<Rc<dyn RememberObserver>>,
    forgetting: Vec<(SlotOrder, Rc<dyn RememberObserver>)>,
    side_effects: Vec<Box<dyn FnOnce()>>,
}

impl RememberManager {
    pub(crate) fn remembering(&mut self, observer: Rc<dyn RememberObserver>) {
        self.remembering.push(observer);
    }

    /// Records an observer leaving the composition. `order` is where its slot
    /// sat in the previous table; removals and replacements can be recorded
    /// in any order.
    pub(crate) fn forgetting(&mut self, order: SlotOrder, observer: Rc<dyn RememberObserver>) {
        self.forgetting.push((order, observer));
    }

    pub(crate) fn side_effect(&mut self, effect: Box<dyn FnOnce()>) {
        self.side_effects.push(effect);
    }

    /// Forgotten values first, in reverse of the order they entered; then
    /// remembered values in the order they entered; then side effects.
    pub(crate) fn dispatch(self) {
        let Self {
            remembering,
            mut forgetting,
            side_effects,
        } = self;
        forgetting.sort_by(|(left, _), (right, _)| right.cmp(left));
        log::trace!(
            "dispatching {} forgotten, {} remembered, {} side effects",
            forgetting.len(),
            remembering.len(),
            side_effects.len()
        );
        for (_, observer) in &forgetting {
            observer.on_forgotten();
        }
        for observer in &remembering {
            observer.on_remembered();
        }
        for effect in side_effects {
            effect();
        }
    }

    /// Notifies values created by an abandoned pass. Pending side effects are
    /// dropped unrun.
    pub(crate) fn abandon(self) {
        for observer in &self.remembering {
            observer.on_abandoned();
        }
    }
}
