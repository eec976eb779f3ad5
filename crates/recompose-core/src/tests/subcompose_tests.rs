use super::*;
use crate::platform::ManualScheduler;
use crate::{
    composition_local_of, composition_reference, mutable_state_of, Composition, CompositionLocal,
    CompositionLocalProvider, Recomposer, TreeApplier,
};
use std::cell::Cell;
use std::sync::Arc;

type Captured = Rc<RefCell<Option<CompositionReference>>>;

fn captured(slot: &Captured) -> CompositionReference {
    slot.borrow().clone().expect("reference composed")
}

#[test]
fn child_starts_from_the_locals_around_its_reference() {
    let recomposer = Recomposer::new(Arc::new(ManualScheduler));
    let theme: CompositionLocal<String> = composition_local_of(|| "light".to_string());
    let mode = mutable_state_of("dark".to_string());
    let slot: Captured = Rc::default();
    let mut parent = Composition::new(TreeApplier::new(), &recomposer);
    parent
        .set_content({
            let (theme, mode, slot) = (theme.clone(), mode.clone(), Rc::clone(&slot));
            move || {
                CompositionLocalProvider([theme.provides(mode.get())], || {
                    *slot.borrow_mut() = Some(composition_reference());
                });
            }
        })
        .expect("parent composition");
    let reference = captured(&slot);
    assert_eq!(reference.parent(), parent.id());

    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut child = Composition::with_parent(TreeApplier::new(), &reference);
    child
        .set_content({
            let (theme, seen) = (theme.clone(), Rc::clone(&seen));
            move || seen.borrow_mut().push(theme.current())
        })
        .expect("child composition");
    assert_eq!(*seen.borrow(), vec!["dark"]);
    assert_eq!(recomposer.composition_count(), 2);
    assert_eq!(reference.child_count(), 1);

    mode.set("contrast".to_string());
    recomposer.recompose_pending().expect("parent then child");

    assert_eq!(*seen.borrow(), vec!["dark", "contrast"]);
    assert_eq!(captured(&slot), reference, "reference is remembered");

    child.dispose().expect("dispose child");
    assert_eq!(reference.child_count(), 0);
}

#[test]
fn changing_the_provided_entries_recomposes_children() {
    let recomposer = Recomposer::new(Arc::new(ManualScheduler));
    let theme: CompositionLocal<String> = composition_local_of(|| "light".to_string());
    let size: CompositionLocal<u32> = composition_local_of(|| 1);
    let sized = mutable_state_of(false);
    let slot: Captured = Rc::default();
    let mut parent = Composition::new(TreeApplier::new(), &recomposer);
    parent
        .set_content({
            let (theme, size, sized, slot) = (theme.clone(), size.clone(), sized.clone(), Rc::clone(&slot));
            move || {
                let mut values = vec![theme.provides("dark".to_string())];
                if sized.get() {
                    values.push(size.provides(2));
                }
                CompositionLocalProvider(values, || {
                    *slot.borrow_mut() = Some(composition_reference());
                });
            }
        })
        .expect("parent composition");
    let reference = captured(&slot);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut child = Composition::with_parent(TreeApplier::new(), &reference);
    child
        .set_content({
            let (size, seen) = (size.clone(), Rc::clone(&seen));
            move || seen.borrow_mut().push(size.current())
        })
        .expect("child composition");
    assert_eq!(*seen.borrow(), vec![1]);

    sized.set(true);
    recomposer.recompose_pending().expect("parent then child");

    assert_eq!(*seen.borrow(), vec![1, 2]);
    assert_eq!(captured(&slot), reference);
    assert!(!child.has_invalidations());
    assert!(!recomposer.has_pending_recompositions());
}

#[test]
fn unchanged_entries_leave_children_alone() {
    let recomposer = Recomposer::new(Arc::new(ManualScheduler));
    let theme: CompositionLocal<String> = composition_local_of(|| "light".to_string());
    let tick = mutable_state_of(0);
    let slot: Captured = Rc::default();
    let mut parent = Composition::new(TreeApplier::new(), &recomposer);
    parent
        .set_content({
            let (theme, tick, slot) = (theme.clone(), tick.clone(), Rc::clone(&slot));
            move || {
                tick.get();
                CompositionLocalProvider([theme.provides("dark".to_string())], || {
                    *slot.borrow_mut() = Some(composition_reference());
                });
            }
        })
        .expect("parent composition");
    let reference = captured(&slot);

    let runs = Rc::new(Cell::new(0));
    let mut child = Composition::with_parent(TreeApplier::new(), &reference);
    child
        .set_content({
            let runs = Rc::clone(&runs);
            move || runs.set(runs.get() + 1)
        })
        .expect("child composition");

    tick.set(1);
    recomposer.recompose_pending().expect("parent only");

    assert_eq!(runs.get(), 1);
    reference.invalidate_children();
    assert!(child.has_invalidations());
    recomposer.recompose_pending().expect("forced child pass");
    assert_eq!(runs.get(), 2);
}
