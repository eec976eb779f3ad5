use super::*;

#[test]
fn default_is_used_outside_of_composition() {
    let local = composition_local_of(|| 7);
    assert_eq!(local.current(), 7);
}

#[test]
fn locals_get_distinct_keys() {
    let first = composition_local_of(|| 0u8);
    let second = composition_local_of(|| 0u8);
    assert_ne!(first.key(), second.key());
    assert_eq!(first.clone().key(), first.key());
}

#[test]
fn derived_context_keeps_parent_values() {
    let base = LocalContext::default().with_values(vec![(1, Rc::new(1u32) as Rc<dyn Any>)]);
    let derived = base.with_values(vec![(2, Rc::new(2u32) as Rc<dyn Any>)]);
    assert_eq!(base.len(), 1);
    assert_eq!(derived.len(), 2);
    assert!(derived.get(1).is_some());
    assert!(base.get(2).is_none());
}
