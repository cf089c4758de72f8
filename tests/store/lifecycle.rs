//! Store lifecycle, health and the unavailable error.

use crate::common::*;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn operations_fail_once_stopped() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let item = add_message(&store, &stream, Message::new("m"));
    let tx = store.begin_local().unwrap();
    store.stop(Duration::from_millis(100)).unwrap();
    assert_eq!(store.health_state(), HealthState::Inactive);

    assert!(store.begin_local().unwrap_err().is_unavailable());
    assert!(store.begin_auto_commit().unwrap_err().is_unavailable());
    assert!(store
        .get_unique_lock_id(StorageStrategy::Always)
        .unwrap_err()
        .is_unavailable());
    assert!(store.get_unique_tick_count().unwrap_err().is_unavailable());
    assert!(store.find_first_matching_item_stream(None).unwrap_err().is_unavailable());
    assert!(stream.find_first_matching_item(None).unwrap_err().is_unavailable());
    assert!(stream
        .remove_first_matching_item(None, &tx)
        .unwrap_err()
        .is_unavailable());
    assert!(store
        .remove_first_matching_item_stream(None, &tx)
        .unwrap_err()
        .is_unavailable());
    assert!(stream
        .add_item(Message::new("late").shared(), &tx)
        .unwrap_err()
        .is_unavailable());
    assert!(stream.new_locking_item_cursor(None).unwrap_err().is_unavailable());
    assert!(item.lock().unwrap_err().is_unavailable());

    // Handles can still be inspected
    assert_eq!(body(&item), "m");
    assert!(matches!(
        store.start(),
        Err(StoreError::InvalidStoreState { .. })
    ));
}

#[test]
fn active_transaction_fails_after_stop() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let tx = store.begin_local().unwrap();
    store.stop(Duration::from_millis(10)).unwrap();

    let err = stream.add_item(Message::new("late").shared(), &tx).unwrap_err();
    assert!(err.is_unavailable());
}

#[test]
fn failed_start_chains_its_cause() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    // Persist an item whose type the next instance does not know about
    {
        let store = open_store(config.clone());
        let stream = add_stream(&store, "queue");
        add_message(&store, &stream, Message::new("m"));
        store.stop_default().unwrap();
    }

    let store = MessageStore::new();
    store.initialize(config).unwrap();
    let err = store.start().unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(store.health_state(), HealthState::Unhealthy);
    assert!(matches!(
        store.startup_failure().as_deref(),
        Some(StoreError::UnknownItemType(name)) if name == MESSAGE_TYPE
    ));

    let err = store.get_unique_tick_count().unwrap_err();
    let cause = err.source().expect("start-up cause");
    assert!(cause.to_string().contains(MESSAGE_TYPE));

    let err = store.begin_local().unwrap_err();
    assert!(err.source().is_some());
    store.destroy().unwrap();
}

#[test]
fn dropping_the_store_stops_it() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    drop(store);
    assert!(stream.find_first_matching_item(None).unwrap_err().is_unavailable());
}

#[test]
fn initialize_from_directory_reads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(CONFIG_FILE_NAME),
        "persistence = \"memory\"\nexpiry_interval_ms = 0\nspill_upper_limit = 10\nspill_lower_limit = 5\n",
    )
    .unwrap();

    let store = MessageStore::new();
    store.initialize_from_directory(dir.path()).unwrap();
    assert_eq!(store.config().spill_upper_limit, 10);
    assert_eq!(store.config().log_directory, dir.path().join("log"));
    store.start().unwrap();

    let tx = store.begin_auto_commit().unwrap();
    let stream = store
        .add_item_stream(Arc::new(StreamDescriptor::new("queue")), &tx)
        .unwrap();
    assert_eq!(stream.spill_limits(), (10, 5));
    store.stop_default().unwrap();
    store.destroy().unwrap();
    assert_eq!(store.state(), StoreState::Destroyed);
}
