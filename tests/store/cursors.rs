//! Locking and non-locking cursors.

use crate::common::*;
use std::sync::Arc;

fn filled(store: &MessageStore, bodies: &[&str]) -> ItemStream {
    let stream = add_stream(store, "queue");
    for b in bodies {
        add_message(store, &stream, Message::new(*b));
    }
    stream
}

#[test]
fn locking_cursor_locks_in_stream_order() {
    let store = memory_store();
    let stream = filled(&store, &["a", "b", "c"]);

    let mut cursor = stream.new_locking_item_cursor(None).unwrap();
    let mut seen = Vec::new();
    while let Some(item) = cursor.next().unwrap() {
        assert_eq!(item.state(), ItemState::Locked);
        assert_eq!(item.lock_id(), Some(cursor.lock_id()));
        seen.push(body(&item));
    }
    assert_eq!(seen, ["a", "b", "c"]);

    let stats = stream.get_statistics();
    assert_eq!(stats.locked_item_count, 3);
    assert_eq!(stats.available_item_count, 0);

    // Everything is claimed
    let mut second = stream.new_locking_item_cursor(None).unwrap();
    assert_ne!(second.lock_id(), cursor.lock_id());
    assert!(second.next().unwrap().is_none());
    assert!(stream.find_first_matching_item(None).unwrap().is_none());
}

#[test]
fn locked_item_is_removed_with_its_lock_id() {
    let store = memory_store();
    let stream = filled(&store, &["a"]);

    let mut cursor = stream.new_locking_item_cursor(None).unwrap();
    let item = cursor.next().unwrap().unwrap();

    let tx = store.begin_local().unwrap();
    let wrong = store.get_unique_lock_id(StorageStrategy::Always).unwrap();
    let err = item.remove(&tx, Some(wrong)).unwrap_err();
    assert!(matches!(err, StoreError::LockIdMismatch { .. }));
    let err = item.remove(&tx, None).unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));

    item.remove(&tx, Some(cursor.lock_id())).unwrap();
    tx.rollback().unwrap();
    assert_eq!(item.state(), ItemState::Locked);
    assert_eq!(item.lock_id(), Some(cursor.lock_id()));

    let tx = store.begin_local().unwrap();
    item.remove(&tx, Some(cursor.lock_id())).unwrap();
    tx.commit().unwrap();
    assert_eq!(item.state(), ItemState::NotInStore);
    assert_eq!(stream.get_statistics().total_item_count, 0);
}

#[test]
fn cursor_skips_items_removed_behind_its_back() {
    let store = memory_store();
    let stream = filled(&store, &["a", "b", "c", "d"]);

    let mut cursor = stream.new_non_locking_item_cursor(None).unwrap();
    assert_eq!(body(&cursor.next().unwrap().unwrap()), "a");

    let tx = store.begin_local().unwrap();
    let b = body_is("b");
    stream.remove_first_matching_item(Some(&b), &tx).unwrap().unwrap();
    tx.commit().unwrap();

    assert_eq!(body(&cursor.next().unwrap().unwrap()), "c");
    assert_eq!(cursor.count_remaining().unwrap(), 1);
}

#[test]
fn non_locking_cursor_changes_nothing() {
    let store = memory_store();
    let stream = filled(&store, &["a", "b", "c"]);

    let wanted: Arc<dyn Filter> = Arc::new(body_is("b"));
    let mut cursor = stream.new_non_locking_item_cursor(Some(wanted)).unwrap();
    let item = cursor.next().unwrap().unwrap();
    assert_eq!(body(&item), "b");
    assert_eq!(item.state(), ItemState::Available);
    assert!(cursor.next().unwrap().is_none());

    let mut all = stream.new_non_locking_item_cursor(None).unwrap();
    assert_eq!(all.count_remaining().unwrap(), 3);
    assert_eq!(stream.get_statistics().available_item_count, 3);
}

#[test]
fn locked_item_can_be_persisted_and_unlocked() {
    let store = memory_store();
    let stream = filled(&store, &["a"]);
    let item = stream.find_first_matching_item(None).unwrap().unwrap();

    let lock_id = item.lock().unwrap();
    assert_eq!(item.state(), ItemState::Locked);
    assert!(matches!(item.lock(), Err(StoreError::InvalidState { .. })));

    let tx = store.begin_local().unwrap();
    item.persist_lock(&tx).unwrap();
    assert_eq!(item.state(), ItemState::Locked);
    tx.commit().unwrap();
    assert_eq!(item.state(), ItemState::PersistentlyLocked);

    item.unlock(lock_id, None).unwrap();
    assert_eq!(item.state(), ItemState::Available);
    assert_eq!(item.lock_id(), None);
}

#[test]
fn transactional_unlock_waits_for_commit() {
    let store = memory_store();
    let stream = filled(&store, &["a"]);
    let item = stream.find_first_matching_item(None).unwrap().unwrap();
    let lock_id = item.lock().unwrap();

    let tx = store.begin_local().unwrap();
    item.unlock(lock_id, Some(&tx)).unwrap();
    assert_eq!(item.state(), ItemState::Locked);
    tx.rollback().unwrap();
    assert_eq!(item.state(), ItemState::Locked);

    let tx = store.begin_local().unwrap();
    item.unlock(lock_id, Some(&tx)).unwrap();
    tx.commit().unwrap();
    assert_eq!(item.state(), ItemState::Available);
}

#[test]
fn unlock_with_wrong_lock_id_fails() {
    let store = memory_store();
    let stream = filled(&store, &["a"]);
    let item = stream.find_first_matching_item(None).unwrap().unwrap();

    let other = store.get_unique_lock_id(StorageStrategy::Always).unwrap();
    assert!(matches!(
        item.unlock(other, None),
        Err(StoreError::InvalidState { .. })
    ));

    let lock_id = item.lock().unwrap();
    assert!(matches!(
        item.unlock(other, None),
        Err(StoreError::LockIdMismatch { .. })
    ));
    item.unlock(lock_id, None).unwrap();
}
