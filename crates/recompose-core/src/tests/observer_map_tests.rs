use super::*;
use std::cell::RefCell;

#[test]
fn add_is_idempotent_per_pair() {
    let mut map: ObserverMap<str, u32> = ObserverMap::new();
    let key: Rc<str> = Rc::from("count");

    assert!(map.add(&key, 1));
    assert!(!map.add(&key, 1));
    assert!(map.add(&key, 2));

    assert_eq!(map.get(&key), &[1, 2]);
    assert_eq!(map.len(), 1);
}

#[test]
fn keys_are_matched_by_allocation() {
    let mut map: ObserverMap<str, u32> = ObserverMap::new();
    let first: Rc<str> = Rc::from("same");
    let second: Rc<str> = Rc::from("same");

    map.add(&first, 1);
    assert!(map.contains_key(&first));
    assert!(!map.contains_key(&second));
    assert!(map.get(&second).is_empty());
    assert_eq!(map.get_equal("same"), &[1]);
}

#[test]
fn mutated_key_is_still_found() {
    let mut map: ObserverMap<RefCell<Vec<u32>>, &'static str> = ObserverMap::new();
    let key = Rc::new(RefCell::new(vec![1]));
    map.add(&key, "reader");

    key.borrow_mut().push(2);

    assert!(map.contains(&key, &"reader"));
    assert_eq!(map.remove_key(&key), vec!["reader"]);
    assert!(map.is_empty());
}

#[test]
fn removing_last_value_drops_the_key() {
    let mut map: ObserverMap<str, u32> = ObserverMap::new();
    let key: Rc<str> = Rc::from("k");
    map.add(&key, 1);

    assert!(!map.remove(&key, &7));
    assert!(map.remove(&key, &1));
    assert!(!map.contains_key(&key));
    assert_eq!(map.keys().count(), 0);
}

#[test]
fn remove_value_sweeps_every_key() {
    let mut map: ObserverMap<str, u32> = ObserverMap::new();
    let a: Rc<str> = Rc::from("a");
    let b: Rc<str> = Rc::from("b");
    map.add(&a, 1);
    map.add(&a, 2);
    map.add(&b, 1);

    map.remove_value(&1);

    assert_eq!(map.get(&a), &[2]);
    assert!(!map.contains_key(&b));
    assert_eq!(map.len(), 1);
}

#[test]
fn remove_values_if_filters_by_predicate() {
    let mut map: ObserverMap<str, u32> = ObserverMap::new();
    let key: Rc<str> = Rc::from("k");
    for value in 0..6 {
        map.add(&key, value);
    }

    map.remove_values_if(|value| value % 2 == 0);

    assert_eq!(map.get(&key), &[1, 3, 5]);
    map.clear();
    assert!(map.is_empty());
}
