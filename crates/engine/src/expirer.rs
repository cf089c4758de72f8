//! Expirer
//!
//! Items with a maximum time in store are entered into a store-wide index
//! keyed by `(deadline, id)` when their add commits, and leave it when they
//! leave the store. A background thread wakes every interval and expires
//! each due item that is `Available`, under an auto-commit transaction.
//!
//! The expirer claims an item through the same link transition that
//! foreground removes and cursors use, so an item that is locked, being
//! removed or otherwise mid-transaction is skipped and stays in the index
//! for the next pass. Stopping the thread leaves the index intact; items
//! that fell due while it was stopped expire on the first pass after a
//! restart of the thread.

use crate::link::ItemLink;
use crate::store::Runtime;
use crate::tasks::RemoveTask;
use msgstore_concurrency::TransactionKind;
use msgstore_core::{now_millis, ItemId};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

struct WorkerShared {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

struct Worker {
    shared: Arc<WorkerShared>,
    handle: JoinHandle<()>,
}

/// Expiry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirerStats {
    /// Items waiting in the expiry index
    pub indexed: usize,
    /// Items expired since the store started
    pub expired: u64,
    /// Expiry attempts that failed and will be retried
    pub failures: u64,
    /// Passes run
    pub passes: u64,
}

/// Expiry index plus its background thread
pub(crate) struct Expirer {
    interval: Option<Duration>,
    index: Mutex<BTreeSet<(u64, ItemId)>>,
    worker: Mutex<Option<Worker>>,
    expired: AtomicU64,
    failures: AtomicU64,
    passes: AtomicU64,
}

impl Expirer {
    /// `None` disables the background thread; the index is still kept
    pub(crate) fn new(interval: Option<Duration>) -> Self {
        Expirer {
            interval,
            index: Mutex::new(BTreeSet::new()),
            worker: Mutex::new(None),
            expired: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    /// Enter an item into the index
    pub(crate) fn track(&self, link: &ItemLink) {
        if let Some(deadline) = link.expiry_deadline() {
            self.index.lock().insert((deadline, link.id()));
        }
    }

    /// Drop an item from the index
    pub(crate) fn forget(&self, link: &ItemLink) {
        if let Some(deadline) = link.expiry_deadline() {
            self.index.lock().remove(&(deadline, link.id()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub(crate) fn stats(&self) -> ExpirerStats {
        ExpirerStats {
            indexed: self.len(),
            expired: self.expired.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Start the background thread; no-op if running or disabled
    pub(crate) fn start(&self, runtime: &Arc<Runtime>) {
        let Some(interval) = self.interval else {
            debug!(target: "msgstore::expirer", "Expirer disabled");
            return;
        };
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let shared = Arc::new(WorkerShared {
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let weak: Weak<Runtime> = Arc::downgrade(runtime);
        let spawned = std::thread::Builder::new()
            .name("msgstore-expirer".to_string())
            .spawn(move || expirer_loop(weak, thread_shared, interval));

        match spawned {
            Ok(handle) => {
                info!(
                    target: "msgstore::expirer",
                    interval_ms = interval.as_millis() as u64,
                    "Expirer started"
                );
                *worker = Some(Worker { shared, handle });
            }
            Err(e) => {
                warn!(target: "msgstore::expirer", error = %e, "Failed to spawn expirer thread");
            }
        }
    }

    /// Stop the background thread and wait for it; no-op if not running
    pub(crate) fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        *worker.shared.shutdown.lock() = true;
        worker.shared.wake.notify_all();
        if worker.handle.thread().id() == std::thread::current().id() {
            return;
        }
        if worker.handle.join().is_err() {
            warn!(target: "msgstore::expirer", "Expirer thread panicked");
        }
        info!(target: "msgstore::expirer", pending = self.len(), "Expirer stopped");
    }

    /// Expire every due item that is available; returns how many expired
    pub(crate) fn run_pass(&self, runtime: &Arc<Runtime>) -> usize {
        self.passes.fetch_add(1, Ordering::Relaxed);
        let now = now_millis();
        let due: Vec<(u64, ItemId)> = self
            .index
            .lock()
            .range(..=(now, ItemId::new(u64::MAX)))
            .copied()
            .collect();
        if due.is_empty() {
            return 0;
        }

        let tx = match runtime.transactions().begin(TransactionKind::AutoCommit) {
            Ok(tx) => tx,
            Err(e) => {
                debug!(target: "msgstore::expirer", error = %e, "Skipping expiry pass");
                return 0;
            }
        };

        let mut expired = 0;
        for (deadline, id) in due {
            let link = match runtime.link(id) {
                Some(link) if link.state().is_in_store() => link,
                _ => {
                    self.index.lock().remove(&(deadline, id));
                    continue;
                }
            };
            if !link.try_begin_expiry() {
                trace!(
                    target: "msgstore::expirer",
                    id = %id,
                    state = link.state().as_str(),
                    "Item not available; expiry deferred"
                );
                continue;
            }
            match tx.enlist(Box::new(RemoveTask::expire(Arc::clone(runtime), link))) {
                Ok(()) => {
                    expired += 1;
                    self.expired.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "msgstore::expirer",
                        id = %id,
                        error = %e,
                        "Expiry failed; will retry"
                    );
                }
            }
        }

        if expired > 0 {
            debug!(target: "msgstore::expirer", expired, "Expiry pass complete");
        }
        expired
    }
}

impl Drop for Expirer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            *worker.shared.shutdown.lock() = true;
            worker.shared.wake.notify_all();
        }
    }
}

fn expirer_loop(runtime: Weak<Runtime>, shared: Arc<WorkerShared>, interval: Duration) {
    loop {
        {
            let mut shutdown = shared.shutdown.lock();
            if !*shutdown {
                shared.wake.wait_for(&mut shutdown, interval);
            }
            if *shutdown {
                break;
            }
        }
        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        runtime.expirer().run_pass(&runtime);
    }
}
