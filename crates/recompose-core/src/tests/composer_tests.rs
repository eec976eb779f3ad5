use super::*;
use crate::{
    remember_with_key, with_current_composer, Composition, ManualScheduler, Operation, Recomposer, TreeApplier,
};
use std::sync::Arc;

const LABEL_KEY: Key = 0x6c61_6265_6c00;

#[derive(Default)]
struct Label {
    text: String,
}

impl Node for Label {}

fn label(text: impl Into<String>) -> NodeId {
    let text = text.into();
    crate::emit(
        LABEL_KEY,
        Label::default,
        |node| node.set(text, |label: &mut Label, text| label.text = text),
        || {},
    )
}

fn compose(content: impl Fn() + 'static) -> (Recomposer, Composition<TreeApplier>) {
    let recomposer = Recomposer::new(Arc::new(ManualScheduler));
    let mut composition = Composition::new(TreeApplier::new(), &recomposer);
    composition.set_content(content).expect("initial composition");
    (recomposer, composition)
}

#[test]
fn remember_runs_init_once() {
    let calculations = Rc::new(Cell::new(0));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let (_recomposer, mut composition) = compose({
        let calculations = Rc::clone(&calculations);
        let seen = Rc::clone(&seen);
        move || {
            let value = crate::remember(|| {
                calculations.set(calculations.get() + 1);
                calculations.get() * 10
            });
            seen.borrow_mut().push(value.get());
        }
    });

    composition.force_recompose_all().expect("second pass");
    composition.force_recompose_all().expect("third pass");

    assert_eq!(calculations.get(), 1);
    assert_eq!(*seen.borrow(), vec![10, 10, 10]);
}

#[test]
fn remember_with_key_recomputes_only_when_key_changes() {
    let key = Rc::new(Cell::new(1));
    let calculations = Rc::new(Cell::new(0));
    let (_recomposer, mut composition) = compose({
        let key = Rc::clone(&key);
        let calculations = Rc::clone(&calculations);
        move || {
            remember_with_key(&key.get(), || calculations.set(calculations.get() + 1));
        }
    });
    assert_eq!(calculations.get(), 1);

    composition.force_recompose_all().expect("same key");
    assert_eq!(calculations.get(), 1);

    key.set(2);
    composition.force_recompose_all().expect("new key");
    assert_eq!(calculations.get(), 2);

    composition.force_recompose_all().expect("key unchanged again");
    assert_eq!(calculations.get(), 2);
}

#[test]
fn changed_compares_with_previous_pass() {
    let value = Rc::new(Cell::new(3));
    let results = Rc::new(RefCell::new(Vec::new()));
    let (_recomposer, mut composition) = compose({
        let value = Rc::clone(&value);
        let results = Rc::clone(&results);
        move || {
            let changed = with_current_composer(|composer| composer.changed(&value.get()));
            results.borrow_mut().push(changed);
        }
    });

    composition.force_recompose_all().expect("unchanged");
    value.set(4);
    composition.force_recompose_all().expect("changed");

    assert_eq!(*results.borrow(), vec![true, false, true]);
}

#[test]
fn cache_recomputes_when_slot_type_differs() {
    let as_text = Rc::new(Cell::new(false));
    let inits = Rc::new(Cell::new(0));
    let (_recomposer, mut composition) = compose({
        let as_text = Rc::clone(&as_text);
        let inits = Rc::clone(&inits);
        move || {
            with_current_composer(|composer| {
                if as_text.get() {
                    composer.cache(false, || {
                        inits.set(inits.get() + 1);
                        "text"
                    });
                } else {
                    composer.cache(false, || {
                        inits.set(inits.get() + 1);
                        7u32
                    });
                }
            });
        }
    });

    composition.force_recompose_all().expect("same type");
    assert_eq!(inits.get(), 1);

    as_text.set(true);
    composition.force_recompose_all().expect("different type");
    assert_eq!(inits.get(), 2);
}

#[test]
fn compound_key_hash_depends_on_call_path_only() {
    let hashes = Rc::new(RefCell::new(Vec::new()));
    let (_recomposer, mut composition) = compose({
        let hashes = Rc::clone(&hashes);
        move || {
            with_current_composer(|composer| {
                composer.with_group(1, || hashes.borrow_mut().push(composer.current_compound_key_hash()));
                composer.with_group(2, || hashes.borrow_mut().push(composer.current_compound_key_hash()));
            });
        }
    });
    composition.force_recompose_all().expect("second pass");

    let hashes = hashes.borrow();
    assert_eq!(hashes.len(), 4);
    assert_ne!(hashes[0], hashes[1]);
    assert_eq!(hashes[0], hashes[2]);
    assert_eq!(hashes[1], hashes[3]);
}

#[test]
fn keyed_rotation_moves_nodes_and_keeps_state() {
    let order = Rc::new(RefCell::new(vec![1u32, 2, 3, 4, 5]));
    let remembered = Rc::new(RefCell::new(Vec::new()));
    let calculations = Rc::new(Cell::new(0));
    let (_recomposer, mut composition) = compose({
        let order = Rc::clone(&order);
        let remembered = Rc::clone(&remembered);
        let calculations = Rc::clone(&calculations);
        move || {
            for id in order.borrow().iter().copied() {
                crate::with_key(&id, || {
                    let owned = crate::remember(|| {
                        calculations.set(calculations.get() + 1);
                        id
                    });
                    remembered.borrow_mut().push((id, owned));
                    label(id.to_string());
                });
            }
        }
    });
    let root = composition.root();
    let before = composition.applier().children(root).to_vec();
    let first_pass: Vec<(u32, Owned<u32>)> = remembered.borrow_mut().drain(..).collect();
    composition.applier_mut().take_operations();

    order.borrow_mut().rotate_left(1);
    composition.force_recompose_all().expect("rotated pass");

    assert_eq!(
        composition.applier_mut().take_operations(),
        vec![Operation::Move {
            parent: root,
            from: 0,
            to: 5,
            count: 1
        }]
    );
    let after = composition.applier().children(root).to_vec();
    assert_eq!(after, vec![before[1], before[2], before[3], before[4], before[0]]);
    assert_eq!(calculations.get(), 5);
    for (id, owned) in remembered.borrow().iter() {
        let (_, original) = first_pass
            .iter()
            .find(|(first_id, _)| first_id == id)
            .expect("item composed in the first pass");
        assert!(owned.ptr_eq(original), "state of item {id} was recreated");
    }
    assert_eq!(composition.slot_table().verify(), Ok(()));
}

#[test]
fn keyed_removal_and_insertion() {
    let order = Rc::new(RefCell::new(vec![1u32, 2, 3]));
    let (_recomposer, mut composition) = compose({
        let order = Rc::clone(&order);
        move || {
            for id in order.borrow().iter().copied() {
                crate::with_key(&id, || {
                    label(id.to_string());
                });
            }
        }
    });
    let root = composition.root();
    let before = composition.applier().children(root).to_vec();
    composition.applier_mut().take_operations();

    *order.borrow_mut() = vec![3, 4, 1];
    composition.force_recompose_all().expect("edited pass");

    let after = composition.applier().children(root).to_vec();
    assert_eq!(after.len(), 3);
    assert_eq!(after[0], before[2]);
    assert_eq!(after[2], before[0]);
    assert!(!before.contains(&after[1]));
    assert!(!composition.applier().contains(before[1]));
    let texts: Vec<String> = after
        .iter()
        .map(|id| {
            composition
                .applier()
                .node::<Label>(*id)
                .map(|label| label.text.clone())
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(texts, vec!["3", "4", "1"]);
}

#[test]
fn duplicate_keys_match_the_first_unused_group_in_previous_order() {
    let order = Rc::new(RefCell::new(vec![1u32, 2, 1]));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let calculations = Rc::new(Cell::new(0));
    let (_recomposer, mut composition) = compose({
        let order = Rc::clone(&order);
        let seen = Rc::clone(&seen);
        let calculations = Rc::clone(&calculations);
        move || {
            for id in order.borrow().iter().copied() {
                crate::with_key(&id, || {
                    let value = crate::remember(|| {
                        calculations.set(calculations.get() + 1);
                        calculations.get()
                    });
                    seen.borrow_mut().push((id, value.get()));
                });
            }
        }
    });
    assert_eq!(*seen.borrow(), vec![(1, 1), (2, 2), (1, 3)]);
    seen.borrow_mut().clear();

    *order.borrow_mut() = vec![2, 1, 1];
    composition.force_recompose_all().expect("reordered pass");

    assert_eq!(*seen.borrow(), vec![(2, 2), (1, 1), (1, 3)]);
    assert_eq!(calculations.get(), 3);
    assert_eq!(composition.slot_table().verify(), Ok(()));
}

#[test]
fn reusable_content_keeps_nodes_and_resets_slots() {
    let key = Rc::new(Cell::new(1u32));
    let calculations = Rc::new(Cell::new(0));
    let (_recomposer, mut composition) = compose({
        let key = Rc::clone(&key);
        let calculations = Rc::clone(&calculations);
        move || {
            let current = key.get();
            crate::reusable_content(&current, || {
                crate::remember(|| calculations.set(calculations.get() + 1));
                label(format!("item {current}"));
            });
        }
    });
    let root = composition.root();
    let node = composition.applier().children(root)[0];

    key.set(2);
    composition.force_recompose_all().expect("reused pass");

    assert_eq!(composition.applier().children(root), &[node]);
    assert_eq!(calculations.get(), 2);
    assert_eq!(
        composition.applier().node::<Label>(node).map(|label| label.text.as_str()),
        Some("item 2")
    );
}

#[test]
fn emit_records_updates_only_for_changed_values() {
    let text = Rc::new(RefCell::new("a".to_string()));
    let (_recomposer, mut composition) = compose({
        let text = Rc::clone(&text);
        move || {
            label(text.borrow().clone());
        }
    });
    let root = composition.root();
    assert_eq!(
        composition.applier_mut().take_operations(),
        vec![
            Operation::Create { node: 1 },
            Operation::Insert {
                parent: root,
                index: 0,
                node: 1
            },
            Operation::Update { node: 1 },
        ]
    );

    composition.force_recompose_all().expect("same text");
    assert!(composition.applier_mut().take_operations().is_empty());

    *text.borrow_mut() = "b".to_string();
    composition.force_recompose_all().expect("new text");
    assert_eq!(
        composition.applier_mut().take_operations(),
        vec![Operation::Update { node: 1 }]
    );
    assert_eq!(
        composition.applier().node::<Label>(1).map(|label| label.text.as_str()),
        Some("b")
    );
}

#[test]
fn updater_init_and_update_follow_insertion() {
    let value = Rc::new(Cell::new(1));
    let log = Rc::new(RefCell::new(Vec::new()));
    let (_recomposer, mut composition) = compose({
        let value = Rc::clone(&value);
        let log = Rc::clone(&log);
        move || {
            let log = Rc::clone(&log);
            let current = value.get();
            crate::emit(
                LABEL_KEY,
                Label::default,
                move |node| {
                    let init_log = Rc::clone(&log);
                    node.init(move |_: &mut Label| init_log.borrow_mut().push("init".to_string()));
                    let update_log = Rc::clone(&log);
                    node.update(current, move |_: &mut Label, v| {
                        update_log.borrow_mut().push(format!("update {v}"))
                    });
                },
                || {},
            );
        }
    });

    composition.force_recompose_all().expect("unchanged");
    value.set(2);
    composition.force_recompose_all().expect("changed");

    assert_eq!(*log.borrow(), vec!["init".to_string(), "update 2".to_string()]);
}

#[test]
fn nested_nodes_are_attached_to_their_parent() {
    let (_recomposer, composition) = compose(|| {
        crate::emit(
            LABEL_KEY,
            Label::default,
            |_| {},
            || {
                label("first");
                label("second");
            },
        );
    });
    let root = composition.root();
    let applier = composition.applier();
    let parent = applier.children(root)[0];
    assert_eq!(applier.children(parent).len(), 2);
    assert_eq!(applier.dump(), "Label\n  Label\n  Label\n");
}

#[test]
fn skipping_an_inserted_group_is_a_structural_error() {
    let recomposer = Recomposer::new(Arc::new(ManualScheduler));
    let mut composition = Composition::new(TreeApplier::new(), &recomposer);

    let error = composition
        .set_content(|| {
            with_current_composer(|composer| {
                composer.start_group(5);
                composer.skip_to_group_end();
                composer.end_group();
            });
        })
        .expect_err("skip while inserting");

    assert!(error.is_structural());
    assert!(composition.slot_table().is_empty());
    assert!(composition.applier().children(composition.root()).is_empty());
}
