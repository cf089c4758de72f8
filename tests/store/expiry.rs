//! Expiry of items past their maximum time in store.

use crate::common::*;
use std::thread;
use std::time::{Duration, Instant};

const TTL: Duration = Duration::from_millis(5);

fn wait_past_deadline() {
    thread::sleep(TTL * 4);
}

#[test]
fn only_items_with_a_time_limit_are_indexed() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    add_message(&store, &stream, Message::new("forever"));
    add_message(&store, &stream, Message::new("brief").with_ttl(TTL));
    add_message(
        &store,
        &stream,
        Message::new("zero").with_ttl(Duration::from_millis(0)),
    );
    assert_eq!(store.expiry_index_size().unwrap(), 1);
}

#[test]
fn uncommitted_items_are_not_indexed() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");

    let tx = store.begin_local().unwrap();
    stream
        .add_item(Message::new("brief").with_ttl(TTL).shared(), &tx)
        .unwrap();
    assert_eq!(store.expiry_index_size().unwrap(), 0);
    tx.commit().unwrap();
    assert_eq!(store.expiry_index_size().unwrap(), 1);
}

#[test]
fn locked_item_does_not_expire() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let events = EventLog::new();
    let locked = add_message(
        &store,
        &stream,
        Message::new("locked").with_ttl(TTL).with_events(&events),
    );
    let free = add_message(
        &store,
        &stream,
        Message::new("free").with_ttl(TTL).with_events(&events),
    );
    let lock_id = locked.lock().unwrap();
    wait_past_deadline();

    assert_eq!(store.run_expiry_pass().unwrap(), 1);
    assert_eq!(free.state(), ItemState::NotInStore);
    assert_eq!(locked.state(), ItemState::Locked);
    assert_eq!(store.expiry_index_size().unwrap(), 1);
    assert_eq!(events.count("expiry"), 1);

    locked.unlock(lock_id, None).unwrap();
    assert_eq!(store.run_expiry_pass().unwrap(), 1);
    assert_eq!(locked.state(), ItemState::NotInStore);
    assert_eq!(store.expiry_index_size().unwrap(), 0);
    assert_eq!(stream.get_statistics().total_item_count, 0);

    let stats = store.expirer_stats().unwrap();
    assert_eq!(stats.expired, 2);
    assert_eq!(stats.indexed, 0);
}

#[test]
fn item_not_yet_due_stays() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let item = add_message(
        &store,
        &stream,
        Message::new("later").with_ttl(Duration::from_secs(3600)),
    );
    assert_eq!(store.run_expiry_pass().unwrap(), 0);
    assert_eq!(item.state(), ItemState::Available);
    assert_eq!(store.expiry_index_size().unwrap(), 1);
}

#[test]
fn silent_items_skip_the_expiry_hook() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let events = EventLog::new();
    add_message(
        &store,
        &stream,
        Message::new("quiet").with_ttl(TTL).silent().with_events(&events),
    );
    add_message(
        &store,
        &stream,
        Message::new("loud").with_ttl(TTL).with_events(&events),
    );
    events.clear();
    wait_past_deadline();

    assert_eq!(store.run_expiry_pass().unwrap(), 2);
    let recorded = events.events();
    assert!(recorded.contains(&"expiry:loud".to_string()));
    assert!(!recorded.contains(&"expiry:quiet".to_string()));
    assert_eq!(events.count("commit_remove"), 2);
}

#[test]
fn removed_item_leaves_the_index() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    add_message(&store, &stream, Message::new("brief").with_ttl(TTL));

    let tx = store.begin_auto_commit().unwrap();
    stream.remove_first_matching_item(None, &tx).unwrap().unwrap();
    assert_eq!(store.expiry_index_size().unwrap(), 0);

    wait_past_deadline();
    assert_eq!(store.run_expiry_pass().unwrap(), 0);
}

#[test]
fn items_due_while_stopped_expire_after_restart_of_expirer() {
    let config = StoreConfig {
        expiry_interval_ms: 10,
        ..memory_config()
    };
    let store = open_store(config);
    store.expirer_stop().unwrap();
    store.expirer_stop().unwrap();

    let stream = add_stream(&store, "queue");
    let item = add_message(&store, &stream, Message::new("brief").with_ttl(TTL));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(item.state(), ItemState::Available);

    store.expirer_start().unwrap();
    store.expirer_start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while item.state() != ItemState::NotInStore && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(item.state(), ItemState::NotInStore);
    assert_eq!(store.expiry_index_size().unwrap(), 0);
}
