//! Unlock and backout counters.

use crate::common::*;

#[test]
fn unlock_count_increments_per_unlock() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let item = add_message(&store, &stream, Message::new("m"));
    assert_eq!(item.guess_unlock_count(), 0);

    for expected in 1..=5 {
        let mut cursor = stream.new_locking_item_cursor(None).unwrap();
        let locked = cursor.next().unwrap().unwrap();
        assert_eq!(locked.id(), item.id());
        locked.unlock(cursor.lock_id(), None).unwrap();
        assert_eq!(item.guess_unlock_count(), expected);
    }
    assert_eq!(item.guess_backout_count(), 0);
}

#[test]
fn rolled_back_unlock_does_not_count() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let item = add_message(&store, &stream, Message::new("m"));
    let lock_id = item.lock().unwrap();

    let tx = store.begin_local().unwrap();
    item.unlock(lock_id, Some(&tx)).unwrap();
    tx.rollback().unwrap();
    assert_eq!(item.guess_unlock_count(), 0);

    item.unlock(lock_id, None).unwrap();
    assert_eq!(item.guess_unlock_count(), 1);
}

#[test]
fn backout_count_tracks_rolled_back_removes() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let item = add_message(&store, &stream, Message::new("m"));

    for expected in 1..=3 {
        let tx = store.begin_local().unwrap();
        stream.remove_first_matching_item(None, &tx).unwrap().unwrap();
        tx.rollback().unwrap();
        assert_eq!(item.guess_backout_count(), expected);
    }
    assert_eq!(item.state(), ItemState::Available);
    assert_eq!(item.guess_unlock_count(), 0);
}
