use super::*;

fn value(text: &'static str) -> SlotValue {
    SlotValue::Value(Rc::new(text))
}

fn header(kind: GroupKind, key: Key) -> GroupHeader {
    GroupHeader::new(kind, key, None)
}

fn anchored(kind: GroupKind, key: Key, anchor: &Anchor) -> GroupHeader {
    let mut header = GroupHeader::new(kind, key, None);
    header.anchor = Some(anchor.clone());
    header
}

fn build(write: impl FnOnce(&mut SlotWriter)) -> Rc<SlotTable> {
    let empty = Rc::new(SlotTable::new());
    let mut writer = empty.open_writer();
    write(&mut writer);
    let pending = writer.finish();
    let mut table = SlotTable::new();
    pending.commit(&mut table);
    Rc::new(table)
}

/// A root with one anchored movable child per key.
fn keyed_children(keys: &[Key], anchors: &[Anchor]) -> Rc<SlotTable> {
    build(|writer| {
        writer.start_group(header(GroupKind::Root, 1));
        for (key, anchor) in keys.iter().zip(anchors) {
            writer.start_group(anchored(GroupKind::Movable, *key, anchor));
            writer.end_group();
        }
        writer.end_group();
    })
}

fn keys(table: &SlotTable) -> Vec<Key> {
    table.groups().map(GroupRecord::key).collect()
}

#[test]
fn writer_records_sizes_and_node_counts() {
    let table = build(|writer| {
        writer.start_group(header(GroupKind::Root, 1));
        writer.start_group(header(GroupKind::Replaceable, 2));
        writer.append_slot(value("a"));
        writer.end_group();
        writer.start_group(header(GroupKind::Node, 3));
        writer.set_node(7);
        writer.end_group();
        writer.end_group();
    });

    assert_eq!(table.verify(), Ok(()));
    assert_eq!(table.group_count(), 3);
    let root = table.group(0).expect("root group");
    assert_eq!(root.size(), 3);
    assert_eq!(root.node_count(), 1);
    assert_eq!(table.group(1).map(GroupRecord::slot_count), Some(1));

    let reader = table.open_reader();
    assert_eq!(reader.children(0).collect::<Vec<_>>(), vec![1, 2]);
    let mut nodes = Vec::new();
    reader.collect_nodes(0, &mut nodes);
    assert_eq!(nodes, vec![7]);
    assert!(reader.contains(0, 2));
    assert!(!reader.contains(1, 2));
}

#[test]
fn slots_are_visited_in_written_order() {
    let table = build(|writer| {
        writer.start_group(header(GroupKind::Root, 1));
        writer.append_slot(value("a"));
        writer.start_group(header(GroupKind::Replaceable, 2));
        writer.append_slot(value("b"));
        writer.end_group();
        writer.append_slot(value("c"));
        writer.end_group();
    });

    let reader = table.open_reader();
    let mut seen = Vec::new();
    let mut orders = Vec::new();
    reader.visit_slots(0, &mut |order, slot| {
        seen.push(*slot.downcast_ref::<&str>().expect("string slot"));
        orders.push(order);
    });
    assert_eq!(seen, vec!["a", "b", "c"]);
    assert!(orders.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(reader.slot_order(0, 1), orders[2]);
    assert_eq!(reader.slot_order(1, 0), orders[1]);
}

#[test]
fn trailing_slots_of_nested_groups_order_inner_first() {
    let table = build(|writer| {
        writer.start_group(header(GroupKind::Root, 1));
        writer.start_group(header(GroupKind::Replaceable, 2));
        writer.start_group(header(GroupKind::Replaceable, 3));
        writer.end_group();
        writer.append_slot(value("inner"));
        writer.end_group();
        writer.append_slot(value("outer"));
        writer.end_group();
    });

    let reader = table.open_reader();
    assert!(reader.slot_order(1, 0) < reader.slot_order(0, 0));
}

#[test]
fn moved_groups_keep_anchors_and_relocate_on_commit() {
    let first = Anchor::new();
    let second = Anchor::new();
    let mut table = keyed_children(&[2, 3], &[first.clone(), second.clone()]);
    assert_eq!(first.location(), Some(1));
    assert_eq!(second.location(), Some(2));

    let reader = table.open_reader();
    let mut writer = table.open_writer();
    writer.start_group(GroupHeader::of(&reader, 0));
    writer.move_group(&reader, 2);
    writer.move_group(&reader, 1);
    writer.end_group();
    let pending = writer.finish();
    drop(reader);

    // The installed table is still the old one until commit.
    assert_eq!(first.location(), Some(1));
    let before = Rc::as_ptr(&table);
    pending.commit(Rc::make_mut(&mut table));
    assert_eq!(Rc::as_ptr(&table), before, "sole owner is edited in place");
    assert_eq!(first.location(), Some(2));
    assert_eq!(second.location(), Some(1));
    assert_eq!(table.verify(), Ok(()));
    assert_eq!(keys(&table), vec![1, 3, 2]);
}

#[test]
fn removed_groups_invalidate_their_anchors() {
    let kept = Anchor::new();
    let dropped = Anchor::new();
    let mut table = keyed_children(&[2, 3], &[kept.clone(), dropped.clone()]);

    let reader = table.open_reader();
    let mut writer = table.open_writer();
    writer.start_group(GroupHeader::of(&reader, 0));
    writer.move_group(&reader, 1);
    writer.remove_group(&reader, 2);
    writer.end_group();
    let pending = writer.finish();
    drop(reader);
    pending.commit(Rc::make_mut(&mut table));

    assert_eq!(kept.location(), Some(1));
    assert!(!dropped.is_valid());
    assert_eq!(table.group_count(), 2);
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn insertion_splices_at_the_gap_and_keeps_the_suffix() {
    let anchors: Vec<Anchor> = (0..4).map(|_| Anchor::new()).collect();
    let mut table = keyed_children(&[10, 11, 12, 13], &anchors);
    assert_eq!(table.gap(), 5);

    let inserted = Anchor::new();
    let reader = table.open_reader();
    let mut writer = table.open_writer();
    writer.start_group(GroupHeader::of(&reader, 0));
    writer.move_group(&reader, 1);
    writer.move_group(&reader, 2);
    writer.start_group(anchored(GroupKind::Movable, 20, &inserted));
    writer.end_group();
    writer.move_group(&reader, 3);
    writer.move_group(&reader, 4);
    writer.end_group();
    let pending = writer.finish();
    assert_eq!(pending.len(), 6);
    drop(reader);
    pending.commit(Rc::make_mut(&mut table));

    assert_eq!(keys(&table), vec![1, 10, 11, 20, 12, 13]);
    assert_eq!(table.gap(), 4, "gap follows the inserted group");
    assert_eq!(inserted.location(), Some(3));
    let locations: Vec<_> = anchors.iter().map(Anchor::location).collect();
    assert_eq!(locations, vec![Some(1), Some(2), Some(4), Some(5)]);
    assert_eq!(table.group(0).map(GroupRecord::size), Some(6));
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn anchors_after_the_gap_follow_later_insertions() {
    let anchors: Vec<Anchor> = (0..3).map(|_| Anchor::new()).collect();
    let mut table = keyed_children(&[10, 11, 12], &anchors);

    // First edit leaves the gap after the new group at index 2.
    for key in [20, 21] {
        let reader = table.open_reader();
        let mut writer = table.open_writer();
        writer.start_group(GroupHeader::of(&reader, 0));
        writer.move_group(&reader, 1);
        writer.start_group(header(GroupKind::Movable, key));
        writer.end_group();
        let rest: Vec<usize> = reader.children(0).skip(1).collect();
        for child in rest {
            writer.move_group(&reader, child);
        }
        writer.end_group();
        let pending = writer.finish();
        drop(reader);
        pending.commit(Rc::make_mut(&mut table));
    }

    assert_eq!(keys(&table), vec![1, 10, 21, 20, 11, 12]);
    let locations: Vec<_> = anchors.iter().map(Anchor::location).collect();
    assert_eq!(locations, vec![Some(1), Some(4), Some(5)]);
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn rewriting_groups_in_place_does_not_move_the_gap() {
    let anchors: Vec<Anchor> = (0..3).map(|_| Anchor::new()).collect();
    let mut table = keyed_children(&[10, 11, 12], &anchors);
    let gap = table.gap();

    let reader = table.open_reader();
    let mut writer = table.open_writer();
    writer.start_group(GroupHeader::of(&reader, 0));
    writer.move_group(&reader, 1);
    writer.start_group(GroupHeader::of(&reader, 2));
    writer.append_slot(value("fresh"));
    writer.end_group();
    writer.move_group(&reader, 3);
    writer.end_group();
    let pending = writer.finish();
    drop(reader);
    pending.commit(Rc::make_mut(&mut table));

    assert_eq!(table.gap(), gap);
    assert_eq!(table.group(2).map(GroupRecord::slot_count), Some(1));
    assert_eq!(anchors[1].location(), Some(2));
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn shared_table_is_copied_before_commit() {
    let anchors = [Anchor::new(), Anchor::new()];
    let mut table = keyed_children(&[10, 11], &anchors);
    let held = Rc::clone(&table);

    let reader = table.open_reader();
    let mut writer = table.open_writer();
    writer.start_group(GroupHeader::of(&reader, 0));
    writer.move_group(&reader, 2);
    writer.move_group(&reader, 1);
    writer.end_group();
    let pending = writer.finish();
    drop(reader);
    pending.commit(Rc::make_mut(&mut table));

    assert!(!Rc::ptr_eq(&held, &table));
    assert_eq!(keys(&held), vec![1, 10, 11]);
    assert_eq!(keys(&table), vec![1, 11, 10]);
    assert_eq!(table.verify(), Ok(()));
}

#[test]
fn verify_reports_stale_anchor() {
    let anchor = Anchor::new();
    let table = build(|writer| {
        writer.start_group(anchored(GroupKind::Root, 1, &anchor));
        writer.end_group();
    });
    assert_eq!(table.verify(), Ok(()));

    anchor.set_location(4);
    assert!(table.verify().is_err());
}

#[test]
#[should_panic(expected = "already has an active writer")]
fn second_writer_panics() {
    let table = Rc::new(SlotTable::new());
    let _first = table.open_writer();
    let _second = table.open_writer();
}

#[test]
fn dropping_writer_releases_table() {
    let table = Rc::new(SlotTable::new());
    {
        let _writer = table.open_writer();
        assert!(table.is_writing());
    }
    assert!(!table.is_writing());

    let mut reader = table.open_reader();
    assert_eq!(table.reader_count(), 1);
    reader.close();
    assert_eq!(table.reader_count(), 0);
}

#[test]
fn debug_lines_are_indented_by_depth() {
    let table = build(|writer| {
        writer.start_group(header(GroupKind::Root, 1));
        writer.start_group(header(GroupKind::Node, 2));
        writer.set_node(3);
        writer.end_group();
        writer.end_group();
    });

    let lines = table.groups_debug();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("[0] Root"));
    assert!(lines[1].starts_with("  [1] Node"));
    assert!(lines[1].ends_with("node=3"));
}
