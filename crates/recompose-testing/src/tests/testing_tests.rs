use super::*;
use recompose_core::{mutable_state_of, useState, withFrameNanos, MutableState, Node};
use recompose_macros::composable;
use std::cell::Cell;
use std::rc::Rc;

const TEXT_KEY: u64 = 0x7465_7874;

#[derive(Default)]
struct TextNode {
    value: String,
}

impl Node for TextNode {
    fn describe(&self) -> String {
        format!("Text({})", self.value)
    }
}

#[allow(non_snake_case)]
#[composable]
fn Text(value: String) {
    recompose_core::emit(
        TEXT_KEY,
        TextNode::default,
        |node| node.set(value, |text: &mut TextNode, value| text.value = value),
        || {},
    );
}

#[allow(non_snake_case)]
#[composable]
fn Counter(state: MutableState<i32>) {
    Text(format!("count {}", state.get()));
}

#[test]
fn set_content_builds_the_tree() {
    let mut rule = ComposeTestRule::new();
    assert!(!rule.has_content());

    rule.set_content(|| {
        Text("hello".to_string());
        Text("world".to_string());
    })
    .expect("initial composition");

    assert!(rule.has_content());
    assert_eq!(rule.root_children().len(), 2);
    assert_eq!(rule.dump_tree(), "Text(hello)\nText(world)\n");
    assert_eq!(rule.slot_table().verify(), Ok(()));
}

#[test]
fn state_changes_are_pumped_into_the_tree() {
    let mut rule = ComposeTestRule::new();
    let state = mutable_state_of(1);
    rule.set_content({
        let state = state.clone();
        move || Counter(state.clone())
    })
    .expect("initial composition");
    rule.take_operations();

    state.set(2);
    rule.pump_until_idle().expect("recompose");

    assert_eq!(rule.dump_tree(), "Text(count 2)\n");
    let node = rule.root_children()[0];
    assert_eq!(rule.take_operations(), vec![Operation::Update { node }]);
}

#[test]
fn advance_frame_delivers_frame_time() {
    let mut rule = ComposeTestRule::new();
    let frame = Rc::new(Cell::new(None));
    rule.set_content({
        let frame = Rc::clone(&frame);
        move || {
            let frame = Rc::clone(&frame);
            withFrameNanos(move |nanos| frame.set(Some(nanos))).detach();
        }
    })
    .expect("initial composition");
    assert_eq!(frame.get(), None);

    rule.advance_frame(33_000_000).expect("frame");

    assert_eq!(frame.get(), Some(33_000_000));
    assert_eq!(rule.frame_time_nanos(), 33_000_000);
}

#[test]
fn remembered_state_survives_forced_passes() {
    run_test_composition(|rule| {
        let handle = Rc::new(Cell::new(None));
        rule.set_content({
            let handle = Rc::clone(&handle);
            move || {
                let count = useState(|| 10);
                handle.set(Some(count.clone()));
                Counter(count);
            }
        })
        .expect("initial composition");
        let first = handle.take().expect("state captured");

        rule.force_recompose_all().expect("forced pass");

        let second = handle.take().expect("state captured again");
        assert!(first.ptr_eq(&second));
        assert_eq!(rule.dump_tree(), "Text(count 10)\n");
    });
}

#[test]
fn bottom_up_applier_builds_the_same_tree() {
    let mut rule = ComposeTestRule::with_applier(TreeApplier::bottom_up());
    rule.set_content(|| {
        recompose_core::emit(
            TEXT_KEY,
            TextNode::default,
            |node| node.set("parent".to_string(), |text: &mut TextNode, value| text.value = value),
            || Text("child".to_string()),
        );
    })
    .expect("initial composition");

    assert_eq!(rule.dump_tree(), "Text(parent)\n  Text(child)\n");
}

#[test]
fn dispose_empties_the_tree() {
    let mut rule = ComposeTestRule::default();
    rule.set_content(|| Text("gone".to_string()))
        .expect("initial composition");

    rule.dispose().expect("dispose");

    assert!(rule.root_children().is_empty());
    assert!(rule.composition().is_disposed());
    assert_eq!(rule.recomposer().composition_count(), 0);
}
