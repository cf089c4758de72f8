//! Item stream behaviour: visibility, ordering, limits and nesting.

use crate::common::*;
use std::sync::Arc;

fn drain_bodies(store: &MessageStore, stream: &ItemStream) -> Vec<String> {
    let mut bodies = Vec::new();
    let tx = store.begin_local().unwrap();
    while let Some(item) = stream.remove_first_matching_item(None, &tx).unwrap() {
        bodies.push(body(&item));
    }
    tx.commit().unwrap();
    bodies
}

#[test]
fn add_is_visible_only_after_commit() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");

    let tx = store.begin_local().unwrap();
    let handle = stream.add_item(Message::new("m1").shared(), &tx).unwrap();
    assert_eq!(handle.state(), ItemState::Adding);

    let stats = stream.get_statistics();
    assert_eq!(stats.total_item_count, 1);
    assert_eq!(stats.adding_item_count, 1);
    assert_eq!(stats.unavailable_item_count, 1);
    assert_eq!(stats.available_item_count, 0);
    assert!(stream.find_first_matching_item(None).unwrap().is_none());

    tx.commit().unwrap();
    assert_eq!(handle.state(), ItemState::Available);
    let stats = stream.get_statistics();
    assert_eq!(stats.available_item_count, 1);
    assert_eq!(stats.unavailable_item_count, 0);

    let found = stream.find_first_matching_item(None).unwrap().unwrap();
    assert_eq!(found.id(), handle.id());
    assert_eq!(body(&found), "m1");
}

#[test]
fn rolled_back_add_leaves_nothing() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");

    let tx = store.begin_local().unwrap();
    let handle = stream.add_item(Message::new("m1").shared(), &tx).unwrap();
    tx.rollback().unwrap();

    assert_eq!(handle.state(), ItemState::NotInStore);
    assert_eq!(stream.get_statistics(), Statistics::default());
    assert!(store.find_by_id(handle.id()).unwrap().is_none());
}

#[test]
fn removal_order_is_priority_then_fifo() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");

    add_message(&store, &stream, Message::new("low").with_priority(1));
    add_message(&store, &stream, Message::new("mid1"));
    add_message(&store, &stream, Message::new("high").with_priority(9));
    add_message(&store, &stream, Message::new("mid2"));

    let oldest = stream.find_oldest_item().unwrap().unwrap();
    assert_eq!(body(&oldest), "high");

    assert_eq!(drain_bodies(&store, &stream), ["high", "mid1", "mid2", "low"]);
    assert_eq!(stream.get_statistics().total_item_count, 0);
}

#[test]
fn oldest_item_is_taken_from_the_highest_priority() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");

    add_message(&store, &stream, Message::new("old-low").with_priority(1));
    let first_high = add_message(&store, &stream, Message::new("high-1").with_priority(9));
    add_message(&store, &stream, Message::new("high-2").with_priority(9));

    let oldest = stream.find_oldest_item().unwrap().unwrap();
    assert_eq!(oldest.id(), first_high.id());
    let head = stream.find_first_matching_item(None).unwrap().unwrap();
    assert_eq!(head.id(), oldest.id());

    // Unavailable items are passed over
    let lock_id = first_high.lock().unwrap();
    assert_eq!(body(&stream.find_oldest_item().unwrap().unwrap()), "high-2");
    first_high.unlock(lock_id, None).unwrap();
    assert_eq!(body(&stream.find_oldest_item().unwrap().unwrap()), "high-1");
}

#[test]
fn priority_above_maximum_is_capped() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let handle = add_message(&store, &stream, Message::new("loud").with_priority(200));
    assert_eq!(handle.priority(), MAX_PRIORITY);
}

#[test]
fn remove_first_matching_uses_filter() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    add_message(&store, &stream, Message::new("a"));
    add_message(&store, &stream, Message::new("b"));

    let tx = store.begin_local().unwrap();
    let wanted = body_is("b");
    let removed = stream
        .remove_first_matching_item(Some(&wanted), &tx)
        .unwrap()
        .unwrap();
    assert_eq!(body(&removed), "b");
    assert_eq!(removed.state(), ItemState::Removing);
    assert!(stream
        .remove_first_matching_item(Some(&wanted), &tx)
        .unwrap()
        .is_none());
    tx.commit().unwrap();

    assert_eq!(removed.state(), ItemState::NotInStore);
    let remaining = stream.find_first_matching_item(None).unwrap().unwrap();
    assert_eq!(body(&remaining), "a");
}

#[test]
fn rolled_back_remove_restores_item() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let handle = add_message(&store, &stream, Message::new("m"));

    let tx = store.begin_local().unwrap();
    stream.remove_first_matching_item(None, &tx).unwrap().unwrap();
    assert_eq!(stream.get_statistics().removing_item_count, 1);
    tx.rollback().unwrap();

    assert_eq!(handle.state(), ItemState::Available);
    assert_eq!(handle.guess_backout_count(), 1);
    assert_eq!(stream.get_statistics().available_item_count, 1);
}

#[test]
fn item_strategy_cannot_exceed_stream() {
    let store = memory_store();
    let tx = store.begin_auto_commit().unwrap();
    let stream = store
        .add_item_stream(
            Arc::new(StreamDescriptor::new("soft").with_strategy(StorageStrategy::Eventually)),
            &tx,
        )
        .unwrap();
    assert_eq!(stream.storage_strategy(), StorageStrategy::Eventually);

    let tx = store.begin_local().unwrap();
    let err = stream
        .add_item(
            Message::new("hard").with_strategy(StorageStrategy::Always).shared(),
            &tx,
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidAddOperation(_)));

    let inherited = stream.add_item(Message::new("plain").shared(), &tx).unwrap();
    assert_eq!(inherited.storage_strategy(), StorageStrategy::Eventually);
    tx.commit().unwrap();
}

#[test]
fn maximum_depth_rejects_adds() {
    let store = memory_store();
    let stream = add_stream(&store, "bounded");
    stream.set_maximum_depth(Some(2));
    add_message(&store, &stream, Message::new("1"));
    add_message(&store, &stream, Message::new("2"));

    let tx = store.begin_local().unwrap();
    let err = stream.add_item(Message::new("3").shared(), &tx).unwrap_err();
    assert!(matches!(err, StoreError::StreamFull { limit: 2, .. }));
    assert!(err.is_retryable());

    stream.set_maximum_depth(None);
    stream.add_item(Message::new("3").shared(), &tx).unwrap();
    tx.commit().unwrap();
    assert_eq!(stream.get_statistics().total_item_count, 3);
}

#[test]
fn cache_limit_rejects_adds() {
    let config = StoreConfig {
        cache_size_limit: 300,
        ..memory_config()
    };
    let store = open_store(config);
    let stream = add_stream(&store, "cached");
    add_message(&store, &stream, Message::new("fits"));

    let tx = store.begin_local().unwrap();
    let err = stream.add_item(Message::new("spills").shared(), &tx).unwrap_err();
    assert!(matches!(err, StoreError::CacheSpaceExhausted { limit: 300, .. }));

    drain_bodies(&store, &stream);
    stream.add_item(Message::new("spills").shared(), &tx).unwrap();
    tx.commit().unwrap();
}

#[test]
fn nested_streams_must_be_empty_to_remove() {
    let store = memory_store();
    let parent = add_stream(&store, "parent");

    let tx = store.begin_auto_commit().unwrap();
    let child = parent
        .add_item_stream(Arc::new(StreamDescriptor::new("child")), &tx)
        .unwrap();
    assert_eq!(parent.item_streams().len(), 1);
    assert_eq!(parent.get_statistics().total_item_count, 0);

    let named = StreamDescriptor::named("child");
    let found = parent
        .find_first_matching_item_stream(Some(&named))
        .unwrap()
        .unwrap();
    assert_eq!(found.id(), child.id());
    assert_eq!(child.handle().stream_id(), Some(parent.id()));

    add_message(&store, &child, Message::new("m"));

    let tx = store.begin_local().unwrap();
    let err = child.remove_item_stream(&tx).unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));
    let err = parent.remove_item_stream(&tx).unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));

    child.remove_first_matching_item(None, &tx).unwrap().unwrap();
    tx.commit().unwrap();

    let tx = store.begin_local().unwrap();
    child.remove_item_stream(&tx).unwrap();
    tx.commit().unwrap();
    assert!(parent.item_streams().is_empty());
    assert_eq!(child.state(), ItemState::NotInStore);
}

#[test]
fn adds_to_a_removed_stream_fail() {
    let store = memory_store();
    let stream = add_stream(&store, "gone");
    let tx = store.begin_auto_commit().unwrap();
    stream.remove_item_stream(&tx).unwrap();

    let tx = store.begin_local().unwrap();
    let err = stream.add_item(Message::new("m").shared(), &tx).unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));
}

#[test]
fn transaction_from_another_store_is_rejected() {
    let store = memory_store();
    let other = memory_store();
    let stream = add_stream(&store, "queue");

    let foreign = other.begin_local().unwrap();
    let err = stream
        .add_item(Message::new("m").shared(), &foreign)
        .unwrap_err();
    assert!(matches!(err, StoreError::TransactionMismatch(_)));
    assert!(err.is_protocol_violation());
}

#[test]
fn completed_transaction_refuses_work() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");

    let tx = store.begin_local().unwrap();
    tx.commit().unwrap();
    let err = stream.add_item(Message::new("m").shared(), &tx).unwrap_err();
    assert!(matches!(err, StoreError::TransactionNotActive { .. }));
}
