//! Restart with file persistence.

use crate::common::*;
use parking_lot::Mutex;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn reopen(dir: &Path) -> MessageStore {
    open_store(file_config(dir))
}

fn queue(store: &MessageStore) -> ItemStream {
    let named = StreamDescriptor::named("queue");
    store
        .find_first_matching_item_stream(Some(&named))
        .unwrap()
        .expect("queue stream restored")
}

fn bodies(stream: &ItemStream) -> Vec<String> {
    let mut cursor = stream.new_non_locking_item_cursor(None).unwrap();
    let mut out = Vec::new();
    while let Some(item) = cursor.next().unwrap() {
        out.push(body(&item));
    }
    out
}

#[test]
fn committed_items_survive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let ids = {
        let store = reopen(dir.path());
        let stream = add_stream(&store, "queue");
        let low = add_message(&store, &stream, Message::new("low").with_priority(1));
        let high = add_message(&store, &stream, Message::new("high").with_priority(8));
        add_message(&store, &stream, Message::new("mid"));

        let tx = store.begin_local().unwrap();
        stream.add_item(Message::new("rolled-back").shared(), &tx).unwrap();
        tx.rollback().unwrap();

        let tx = store.begin_local().unwrap();
        let mid = body_is("mid");
        stream.remove_first_matching_item(Some(&mid), &tx).unwrap().unwrap();
        tx.commit().unwrap();
        store.stop_default().unwrap();
        (low.id(), high.id())
    };

    let store = reopen(dir.path());
    let stream = queue(&store);
    assert_eq!(bodies(&stream), ["high", "low"]);

    let high = store.find_by_id(ids.1).unwrap().unwrap();
    assert_eq!(high.priority(), 8);
    assert_eq!(high.state(), ItemState::Available);
    assert_eq!(high.stream_id(), Some(stream.id()));

    let stats = stream.get_statistics();
    assert_eq!(stats.total_item_count, 2);
    assert_eq!(stats.available_item_count, 2);

    // New ids continue above the recovered ones
    let added = add_message(&store, &stream, Message::new("new").with_priority(1));
    assert!(added.id() > ids.0 && added.id() > ids.1);
    assert_eq!(bodies(&stream), ["high", "low", "new"]);
}

#[test]
fn strategies_decide_what_survives() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = reopen(dir.path());
        let stream = add_stream(&store, "queue");
        for strategy in [
            StorageStrategy::Never,
            StorageStrategy::Maybe,
            StorageStrategy::Eventually,
            StorageStrategy::Always,
        ] {
            add_message(
                &store,
                &stream,
                Message::new(strategy.as_str()).with_strategy(strategy),
            );
        }
        store.stop_default().unwrap();
    }

    let store = reopen(dir.path());
    let mut survivors = bodies(&queue(&store));
    survivors.sort();
    let mut expected = vec![
        StorageStrategy::Always.as_str(),
        StorageStrategy::Eventually.as_str(),
    ];
    expected.sort();
    assert_eq!(survivors, expected);
}

#[test]
fn only_persisted_locks_survive() {
    let dir = tempfile::tempdir().unwrap();
    let (persisted_id, persisted_lock, plain_id) = {
        let store = reopen(dir.path());
        let stream = add_stream(&store, "queue");
        let persisted = add_message(&store, &stream, Message::new("persisted"));
        let plain = add_message(&store, &stream, Message::new("plain"));

        let lock_id = persisted.lock().unwrap();
        let tx = store.begin_local().unwrap();
        persisted.persist_lock(&tx).unwrap();
        tx.commit().unwrap();
        plain.lock().unwrap();

        store.stop_default().unwrap();
        (persisted.id(), lock_id, plain.id())
    };

    let store = reopen(dir.path());
    let persisted = store.find_by_id(persisted_id).unwrap().unwrap();
    assert_eq!(persisted.state(), ItemState::PersistentlyLocked);
    assert_eq!(persisted.lock_id(), Some(persisted_lock));
    let plain = store.find_by_id(plain_id).unwrap().unwrap();
    assert_eq!(plain.state(), ItemState::Available);

    // Fresh lock ids never collide with the recovered one
    let fresh = store.get_unique_lock_id(StorageStrategy::Always).unwrap();
    assert!(fresh > persisted_lock);

    persisted.unlock(persisted_lock, None).unwrap();
    store.stop_default().unwrap();
    drop(store);

    let store = reopen(dir.path());
    let persisted = store.find_by_id(persisted_id).unwrap().unwrap();
    assert_eq!(persisted.state(), ItemState::Available);
}

/// Transient item that tries to release another item's lock while its own
/// add is being committed
struct UnlockDuringCommit {
    target: ItemHandle,
    lock_id: LockId,
    outcome: Mutex<Option<StoreResult<()>>>,
}

impl OnPrecommitAdd for UnlockDuringCommit {
    fn on_precommit_add(&self, _tx: TransactionId) -> StoreResult<()> {
        *self.outcome.lock() = Some(self.target.unlock(self.lock_id, None));
        Ok(())
    }
}

impl Item for UnlockDuringCommit {
    fn type_name(&self) -> &'static str {
        "test.unlock-during-commit"
    }

    fn storage_strategy(&self) -> Option<StorageStrategy> {
        Some(StorageStrategy::Never)
    }

    fn hooks(&self) -> ItemHooks<'_> {
        ItemHooks::none().with_precommit_add(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn lock_being_persisted_cannot_be_released() {
    let dir = tempfile::tempdir().unwrap();
    let (id, lock_id) = {
        let store = reopen(dir.path());
        let stream = add_stream(&store, "queue");
        let item = add_message(&store, &stream, Message::new("m"));
        let lock_id = item.lock().unwrap();

        let unlocker = Arc::new(UnlockDuringCommit {
            target: item.clone(),
            lock_id,
            outcome: Mutex::new(None),
        });
        let tx = store.begin_local().unwrap();
        item.persist_lock(&tx).unwrap();
        stream.add_item(unlocker.clone(), &tx).unwrap();
        tx.commit().unwrap();

        assert!(matches!(
            unlocker.outcome.lock().take(),
            Some(Err(StoreError::InvalidState { .. }))
        ));
        assert_eq!(item.state(), ItemState::PersistentlyLocked);
        assert_eq!(item.lock_id(), Some(lock_id));
        assert_eq!(item.guess_unlock_count(), 0);
        store.stop_default().unwrap();
        (item.id(), lock_id)
    };

    let store = reopen(dir.path());
    let item = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(item.state(), ItemState::PersistentlyLocked);
    assert_eq!(item.lock_id(), Some(lock_id));
    item.unlock(lock_id, None).unwrap();
    assert_eq!(item.state(), ItemState::Available);
}

#[test]
fn rolled_back_persist_lock_leaves_lock_releasable() {
    let store = memory_store();
    let stream = add_stream(&store, "queue");
    let item = add_message(&store, &stream, Message::new("m"));
    let lock_id = item.lock().unwrap();

    let tx = store.begin_local().unwrap();
    item.persist_lock(&tx).unwrap();
    stream
        .add_item(Message::new("veto").vetoing().shared(), &tx)
        .unwrap();
    assert!(tx.commit().is_err());

    assert_eq!(item.state(), ItemState::Locked);
    item.unlock(lock_id, None).unwrap();
    assert_eq!(item.state(), ItemState::Available);
}

#[test]
fn tick_counts_never_repeat_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let last = {
        let store = reopen(dir.path());
        let mut last = 0;
        for _ in 0..5 {
            last = store.get_unique_tick_count().unwrap();
        }
        store.stop_default().unwrap();
        last
    };

    let store = reopen(dir.path());
    assert!(store.get_unique_tick_count().unwrap() > last);
}

#[test]
fn nested_streams_and_references_are_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let item_id = {
        let store = reopen(dir.path());
        let stream = add_stream(&store, "queue");
        let tx = store.begin_local().unwrap();
        let child = stream
            .add_item_stream(Arc::new(StreamDescriptor::new("child")), &tx)
            .unwrap();
        let refs = child
            .add_reference_stream(Arc::new(StreamDescriptor::new("refs")), &tx)
            .unwrap();
        let item = stream.add_item(Message::new("shared").shared(), &tx).unwrap();
        refs.add_reference(&item, &tx).unwrap();
        tx.commit().unwrap();
        store.stop_default().unwrap();
        item.id()
    };

    let store = reopen(dir.path());
    let stream = queue(&store);
    let child = stream.item_streams().pop().expect("child stream");
    let refs = child.reference_streams().pop().expect("reference stream");

    let item = store.find_by_id(item_id).unwrap().unwrap();
    assert_eq!(item.reference_count(), 1);
    let reference = refs.find_first_matching_reference(None).unwrap().unwrap();
    assert_eq!(reference.referred_id(), Some(item_id));
    assert_eq!(body(&reference), "shared");
}

#[test]
fn dangling_references_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = reopen(dir.path());
        let stream = add_stream(&store, "queue");
        let tx = store.begin_auto_commit().unwrap();
        let refs = stream
            .add_reference_stream(Arc::new(StreamDescriptor::new("refs")), &tx)
            .unwrap();
        let item = add_message(&store, &stream, Message::new("m"));
        refs.add_reference(&item, &tx).unwrap();

        let tx = store.begin_local().unwrap();
        item.remove(&tx, None).unwrap();
        tx.commit().unwrap();
        assert_eq!(refs.get_statistics().total_item_count, 1);
        store.stop_default().unwrap();
    }

    for _ in 0..2 {
        let store = reopen(dir.path());
        let refs = queue(&store).reference_streams().pop().unwrap();
        assert_eq!(refs.get_statistics().total_item_count, 0);
        store.stop_default().unwrap();
    }
}

#[test]
fn overdue_items_expire_on_first_pass() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = reopen(dir.path());
        let stream = add_stream(&store, "queue");
        add_message(
            &store,
            &stream,
            Message::new("brief").with_ttl(Duration::from_millis(5)),
        );
        store.stop_default().unwrap();
    }
    thread::sleep(Duration::from_millis(20));

    let store = reopen(dir.path());
    assert_eq!(store.expiry_index_size().unwrap(), 1);
    assert_eq!(store.run_expiry_pass().unwrap(), 1);
    assert!(bodies(&queue(&store)).is_empty());
}

#[test]
fn clean_start_discards_everything() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = reopen(dir.path());
        let stream = add_stream(&store, "queue");
        add_message(&store, &stream, Message::new("m"));
        store.stop_default().unwrap();
    }

    let config = StoreConfig {
        clean_persistence_on_start: true,
        ..file_config(dir.path())
    };
    let store = open_store(config);
    assert!(store.item_streams().unwrap().is_empty());
}
