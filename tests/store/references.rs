//! Reference streams and reference consistency.

use crate::common::*;
use std::sync::Arc;

fn add_reference_stream(store: &MessageStore, owner: &ItemStream, name: &str) -> ReferenceStream {
    let tx = store.begin_auto_commit().unwrap();
    owner
        .add_reference_stream(Arc::new(StreamDescriptor::new(name)), &tx)
        .unwrap()
}

#[test]
fn reference_added_with_its_item() {
    let store = memory_store();
    let stream = add_stream(&store, "items");
    let refs = add_reference_stream(&store, &stream, "refs");
    assert_eq!(refs.owning_stream_id(), Some(stream.id()));
    assert_eq!(stream.reference_streams().len(), 1);

    let tx = store.begin_local().unwrap();
    let item = stream
        .add_item(Message::new("m").with_priority(7).shared(), &tx)
        .unwrap();
    let reference = refs.add_reference(&item, &tx).unwrap();
    assert_eq!(item.reference_count(), 1);
    tx.commit().unwrap();

    assert!(reference.is_reference());
    assert_eq!(reference.referred_id(), Some(item.id()));
    assert_eq!(reference.priority(), 7);
    assert_eq!(body(&reference), "m");
    assert_eq!(refs.get_statistics().available_item_count, 1);
    assert_eq!(stream.get_statistics().available_item_count, 1);
}

#[test]
fn reference_to_committed_item_from_any_transaction() {
    let store = memory_store();
    let stream = add_stream(&store, "items");
    let refs = add_reference_stream(&store, &stream, "refs");
    let item = add_message(&store, &stream, Message::new("m"));

    let tx = store.begin_local().unwrap();
    refs.add_reference(&item, &tx).unwrap();
    tx.commit().unwrap();
    assert_eq!(item.reference_count(), 1);
}

#[test]
fn reference_to_item_of_another_transaction_is_rejected() {
    let store = memory_store();
    let stream = add_stream(&store, "items");
    let refs = add_reference_stream(&store, &stream, "refs");

    let adding = store.begin_local().unwrap();
    let item = stream.add_item(Message::new("m").shared(), &adding).unwrap();

    let other = store.begin_local().unwrap();
    let err = refs.add_reference(&item, &other).unwrap_err();
    assert!(matches!(err, StoreError::ReferenceConsistencyViolation(_)));
    assert_eq!(item.reference_count(), 0);
    adding.commit().unwrap();
    other.rollback().unwrap();
}

#[test]
fn reference_across_streams_is_rejected() {
    let store = memory_store();
    let left = add_stream(&store, "left");
    let right = add_stream(&store, "right");
    let refs = add_reference_stream(&store, &left, "refs");
    let item = add_message(&store, &right, Message::new("m"));

    let tx = store.begin_local().unwrap();
    let err = refs.add_reference(&item, &tx).unwrap_err();
    assert!(matches!(err, StoreError::ReferenceConsistencyViolation(_)));
    assert!(err.is_protocol_violation());
}

#[test]
fn reference_from_nested_stream_to_ancestor_item() {
    let store = memory_store();
    let parent = add_stream(&store, "parent");
    let tx = store.begin_auto_commit().unwrap();
    let child = parent
        .add_item_stream(Arc::new(StreamDescriptor::new("child")), &tx)
        .unwrap();
    let refs = add_reference_stream(&store, &child, "refs");

    let in_parent = add_message(&store, &parent, Message::new("up"));
    let tx = store.begin_local().unwrap();
    refs.add_reference(&in_parent, &tx).unwrap();
    tx.commit().unwrap();

    // The reverse direction is outside the tree
    let parent_refs = add_reference_stream(&store, &parent, "parent-refs");
    let in_child = add_message(&store, &child, Message::new("down"));
    let tx = store.begin_local().unwrap();
    let err = parent_refs.add_reference(&in_child, &tx).unwrap_err();
    assert!(matches!(err, StoreError::ReferenceConsistencyViolation(_)));
}

#[test]
fn only_items_in_the_store_can_be_referenced() {
    let store = memory_store();
    let stream = add_stream(&store, "items");
    let refs = add_reference_stream(&store, &stream, "refs");
    let item = add_message(&store, &stream, Message::new("m"));

    let tx = store.begin_local().unwrap();
    let err = refs.add_reference(&stream.handle(), &tx).unwrap_err();
    assert!(matches!(err, StoreError::InvalidAddOperation(_)));

    let removing = store.begin_auto_commit().unwrap();
    item.remove(&removing, None).unwrap();
    let err = refs.add_reference(&item, &tx).unwrap_err();
    assert!(matches!(err, StoreError::InvalidAddOperation(_)));
}

#[test]
fn rolled_back_reference_releases_the_count() {
    let store = memory_store();
    let stream = add_stream(&store, "items");
    let refs = add_reference_stream(&store, &stream, "refs");
    let item = add_message(&store, &stream, Message::new("m"));

    let tx = store.begin_local().unwrap();
    refs.add_reference(&item, &tx).unwrap();
    assert_eq!(item.reference_count(), 1);
    tx.rollback().unwrap();
    assert_eq!(item.reference_count(), 0);
    assert_eq!(refs.get_statistics().total_item_count, 0);
}

#[test]
fn removing_a_reference_keeps_the_item() {
    let store = memory_store();
    let stream = add_stream(&store, "items");
    let refs = add_reference_stream(&store, &stream, "refs");
    let events = EventLog::new();
    let a = add_message(&store, &stream, Message::new("a").with_events(&events));
    let b = add_message(&store, &stream, Message::new("b").with_events(&events));

    let tx = store.begin_local().unwrap();
    refs.add_reference(&a, &tx).unwrap();
    refs.add_reference(&b, &tx).unwrap();
    tx.commit().unwrap();
    events.clear();

    let wanted = body_is("b");
    let found = refs.find_first_matching_reference(Some(&wanted)).unwrap().unwrap();
    assert_eq!(found.referred_id(), Some(b.id()));

    let tx = store.begin_local().unwrap();
    let removed = refs
        .remove_first_matching_reference(Some(&wanted), &tx)
        .unwrap()
        .unwrap();
    tx.commit().unwrap();

    assert_eq!(removed.state(), ItemState::NotInStore);
    assert_eq!(b.state(), ItemState::Available);
    assert_eq!(b.reference_count(), 0);
    assert_eq!(a.reference_count(), 1);
    assert!(events.events().is_empty());

    let mut cursor = refs.new_non_locking_reference_cursor(None).unwrap();
    assert_eq!(cursor.count_remaining().unwrap(), 1);
}

#[test]
fn locking_reference_cursor_leaves_item_unlocked() {
    let store = memory_store();
    let stream = add_stream(&store, "items");
    let refs = add_reference_stream(&store, &stream, "refs");
    let item = add_message(&store, &stream, Message::new("m"));
    let tx = store.begin_auto_commit().unwrap();
    refs.add_reference(&item, &tx).unwrap();

    let mut cursor = refs.new_locking_reference_cursor(None).unwrap();
    let reference = cursor.next().unwrap().unwrap();
    assert_eq!(reference.state(), ItemState::Locked);
    assert_eq!(item.state(), ItemState::Available);

    let tx = store.begin_local().unwrap();
    reference.remove(&tx, Some(cursor.lock_id())).unwrap();
    tx.commit().unwrap();
    assert_eq!(item.reference_count(), 0);
}

#[test]
fn reference_stream_must_be_empty_to_remove() {
    let store = memory_store();
    let stream = add_stream(&store, "items");
    let refs = add_reference_stream(&store, &stream, "refs");
    let item = add_message(&store, &stream, Message::new("m"));
    let tx = store.begin_auto_commit().unwrap();
    refs.add_reference(&item, &tx).unwrap();

    let tx = store.begin_local().unwrap();
    assert!(matches!(
        refs.remove_reference_stream(&tx),
        Err(StoreError::InvalidState { .. })
    ));
    refs.remove_first_matching_reference(None, &tx).unwrap().unwrap();
    tx.commit().unwrap();

    let tx = store.begin_local().unwrap();
    refs.remove_reference_stream(&tx).unwrap();
    tx.commit().unwrap();
    assert!(stream.reference_streams().is_empty());
}
