//! File-backed persistence manager
//!
//! Three files, each starting with the store file header:
//!
//! - `log/msgstore.log`: one commit frame per committed transaction,
//!   appended in commit order
//! - `permanent/msgstore.store`: checkpoint image, one snapshot frame per
//!   live record, replaced atomically (write temp file, fsync, rename)
//! - `temporary/msgstore.spill`: `Maybe` records of spilling streams,
//!   truncated on every start
//!
//! Recovery replays the permanent store and then the log. A torn trailing
//! frame in the log is the footprint of a crash mid-append; it is cut off
//! and the commit it belonged to is treated as never having happened.
//!
//! When the log grows past `log_file_size` the live state is checkpointed
//! into the permanent store and the log is emptied. If the checkpoint
//! would exceed `permanent_store_file_max_size`, further adds are refused
//! with `PersistentStoreFull` until removals shrink the image again.

use crate::encoding::{
    check_file_header, decode_frames, encode_frame, file_header, FILE_HEADER_SIZE,
};
use crate::manager::{PersistenceConfig, PersistenceCounters, PersistenceManager, StartOptions};
use crate::record::{CommitBatch, IdGeneratorKind, LogFrame, PersistedRecord};
use crate::recovery::RecoveredState;
use msgstore_core::{StoreError, StoreResult, TransactionId};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Persistence manager writing to local files
pub struct FileLogPersistence {
    config: PersistenceConfig,
    inner: Mutex<FileLogInner>,
}

struct FileLogInner {
    log: Option<File>,
    spill: Option<File>,
    /// Current log length in bytes, header included
    log_size: u64,
    /// Live state as of the last successful write
    image: RecoveredState,
    /// Replayed state waiting to be handed to the store
    recovered: Option<RecoveredState>,
    /// Size and limit of the last checkpoint that did not fit
    store_full: Option<(u64, u64)>,
    writes_since_sync: usize,
    last_sync: Instant,
    unsynced: bool,
    counters: PersistenceCounters,
    /// Fail the next fsync (crash injection for tests)
    #[cfg(test)]
    fail_next_sync: bool,
}

impl FileLogInner {
    fn new() -> Self {
        FileLogInner {
            log: None,
            spill: None,
            log_size: 0,
            image: RecoveredState::new(),
            recovered: None,
            store_full: None,
            writes_since_sync: 0,
            last_sync: Instant::now(),
            unsynced: false,
            counters: PersistenceCounters::default(),
            #[cfg(test)]
            fail_next_sync: false,
        }
    }

    fn reset_sync_counters(&mut self) {
        self.writes_since_sync = 0;
        self.last_sync = Instant::now();
        self.unsynced = false;
    }
}

impl FileLogPersistence {
    /// Create a manager; nothing is opened until `start`
    pub fn new(config: PersistenceConfig) -> Self {
        FileLogPersistence {
            config,
            inner: Mutex::new(FileLogInner::new()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    fn remove_if_exists(path: &Path) -> StoreResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_permanent_store(&self, state: &mut RecoveredState) -> StoreResult<()> {
        let path = self.config.permanent_store_path();
        if !path.exists() {
            return Ok(());
        }
        let bytes = fs::read(&path)?;
        check_file_header(&bytes)?;
        let decoded = decode_frames(&bytes[FILE_HEADER_SIZE..], FILE_HEADER_SIZE as u64)?;
        if decoded.torn_tail {
            return Err(StoreError::Corruption(format!(
                "permanent store {} ends in a partial frame",
                path.display()
            )));
        }
        for frame in &decoded.frames {
            state.apply_frame(frame);
        }
        debug!(
            target: "msgstore::persistence",
            frames = decoded.frames.len(),
            "Loaded permanent store"
        );
        Ok(())
    }

    /// Replay the log and open it for appending
    fn open_log(&self, state: &mut RecoveredState) -> StoreResult<(File, u64)> {
        let path = self.config.log_path();
        let existing = if path.exists() { fs::read(&path)? } else { Vec::new() };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if existing.is_empty() {
            file.write_all(&file_header())?;
            file.sync_all()?;
            return Ok((file, FILE_HEADER_SIZE as u64));
        }

        check_file_header(&existing)?;
        let decoded = decode_frames(&existing[FILE_HEADER_SIZE..], FILE_HEADER_SIZE as u64)?;
        for frame in &decoded.frames {
            state.apply_frame(frame);
        }

        let valid = (FILE_HEADER_SIZE + decoded.valid_len) as u64;
        if decoded.torn_tail {
            warn!(
                target: "msgstore::recovery",
                path = %path.display(),
                valid_bytes = valid,
                discarded_bytes = existing.len() as u64 - valid,
                "Truncating torn trailing record in log"
            );
            file.set_len(valid)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid))?;
        Ok((file, valid))
    }

    fn open_spill(&self) -> StoreResult<File> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.config.spill_path())?;
        file.write_all(&file_header())?;
        Ok(file)
    }

    /// Append one frame to the log, cutting it back on a failed write
    fn append_log(&self, inner: &mut FileLogInner, frame: &LogFrame) -> StoreResult<()> {
        let bytes = encode_frame(frame)?;
        let log = inner
            .log
            .as_mut()
            .ok_or_else(|| StoreError::persistence("log is not open"))?;

        if let Err(e) = log.write_all(&bytes) {
            error!(
                target: "msgstore::persistence",
                error = %e,
                "Log append failed; truncating partial frame"
            );
            let size = inner.log_size;
            Self::rewind_log(inner, size);
            return Err(e.into());
        }

        inner.log_size += bytes.len() as u64;
        inner.counters.log_appends += 1;
        inner.counters.bytes_written += bytes.len() as u64;
        inner.writes_since_sync += 1;
        inner.unsynced = true;
        Ok(())
    }

    /// Cut the log back to `size` bytes
    fn rewind_log(inner: &mut FileLogInner, size: u64) {
        if let Some(log) = inner.log.as_mut() {
            let _ = log.set_len(size);
            let _ = log.seek(SeekFrom::Start(size));
        }
        inner.log_size = size;
    }

    fn sync_log(inner: &mut FileLogInner) -> StoreResult<()> {
        #[cfg(test)]
        if std::mem::take(&mut inner.fail_next_sync) {
            return Err(
                std::io::Error::new(std::io::ErrorKind::Other, "injected fsync failure").into(),
            );
        }
        if let Some(log) = inner.log.as_mut() {
            log.sync_data()?;
            inner.counters.sync_calls += 1;
        }
        inner.reset_sync_counters();
        Ok(())
    }

    fn maybe_sync(&self, inner: &mut FileLogInner) -> StoreResult<()> {
        let policy = self.config.sync_policy;
        let overdue = inner.last_sync.elapsed().as_millis() as u64 >= policy.interval_ms;
        if inner.unsynced && (overdue || inner.writes_since_sync >= policy.batch_size) {
            Self::sync_log(inner)?;
        }
        Ok(())
    }

    fn append_spill(
        inner: &mut FileLogInner,
        tx: Option<TransactionId>,
        records: Vec<PersistedRecord>,
    ) -> StoreResult<()> {
        let bytes = encode_frame(&LogFrame::Commit { tx, records })?;
        if let Some(spill) = inner.spill.as_mut() {
            spill.write_all(&bytes)?;
            inner.counters.spill_appends += 1;
            inner.counters.bytes_written += bytes.len() as u64;
        }
        Ok(())
    }

    /// Rewrite the permanent store from the live image and empty the log
    fn checkpoint(&self, inner: &mut FileLogInner) -> StoreResult<()> {
        let target = self.config.permanent_store_path();
        let tmp = target.with_extension("store.tmp");
        let limit = self.config.permanent_store_file_max_size;

        let mut buf = file_header().to_vec();
        for record in inner.image.to_records() {
            buf.extend_from_slice(&encode_frame(&LogFrame::Snapshot(record))?);
        }
        let size = buf.len() as u64;
        if size > limit {
            return Err(StoreError::PersistentStoreFull { size, limit });
        }

        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;

        if let Some(log) = inner.log.as_mut() {
            log.set_len(FILE_HEADER_SIZE as u64)?;
            log.seek(SeekFrom::Start(FILE_HEADER_SIZE as u64))?;
            log.sync_all()?;
        }
        inner.log_size = FILE_HEADER_SIZE as u64;
        inner.counters.checkpoints += 1;
        inner.counters.bytes_written += size;
        inner.reset_sync_counters();

        info!(
            target: "msgstore::persistence",
            bytes = size,
            live = inner.image.len(),
            "Checkpointed log into permanent store"
        );
        Ok(())
    }

    fn checkpoint_if_needed(&self, inner: &mut FileLogInner) {
        if inner.log_size <= self.config.log_file_size {
            return;
        }
        match self.checkpoint(inner) {
            Ok(()) => inner.store_full = None,
            Err(StoreError::PersistentStoreFull { size, limit }) => {
                if inner.store_full.is_none() {
                    warn!(
                        target: "msgstore::persistence",
                        size,
                        limit,
                        "Permanent store full; refusing new adds until space is freed"
                    );
                }
                inner.store_full = Some((size, limit));
            }
            Err(e) => {
                error!(
                    target: "msgstore::persistence",
                    error = %e,
                    "Checkpoint failed; log keeps growing"
                );
            }
        }
    }
}

impl PersistenceManager for FileLogPersistence {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn start(&self, options: &StartOptions) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.log.is_some() {
            return Err(StoreError::persistence("file persistence already started"));
        }

        for dir in [
            &self.config.log_directory,
            &self.config.permanent_store_directory,
            &self.config.temporary_store_directory,
        ] {
            fs::create_dir_all(dir)?;
        }

        if options.clean {
            info!(
                target: "msgstore::persistence",
                log = %self.config.log_path().display(),
                "Cleaning persistence on start"
            );
            Self::remove_if_exists(&self.config.log_path())?;
            Self::remove_if_exists(&self.config.permanent_store_path())?;
            Self::remove_if_exists(&self.config.spill_path())?;
        }

        let mut state = RecoveredState::new();
        self.load_permanent_store(&mut state)?;
        let (log, log_size) = self.open_log(&mut state)?;
        let spill = self.open_spill()?;

        info!(
            target: "msgstore::persistence",
            live = state.len(),
            log_bytes = log_size,
            orphans = state.stats().orphaned_records,
            "File persistence started"
        );

        inner.log = Some(log);
        inner.spill = Some(spill);
        inner.log_size = log_size;
        inner.image = state.clone();
        inner.recovered = Some(state);
        inner.store_full = None;
        inner.reset_sync_counters();
        Ok(())
    }

    fn recover(&self) -> StoreResult<RecoveredState> {
        let mut inner = self.inner.lock();
        if inner.log.is_none() {
            return Err(StoreError::persistence("file persistence not started"));
        }
        Ok(match inner.recovered.take() {
            Some(state) => state,
            None => inner.image.clone(),
        })
    }

    fn write(&self, batch: &CommitBatch) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.log.is_none() {
            return Err(StoreError::persistence("file persistence not started"));
        }

        let log_records: Vec<PersistedRecord> = batch.log_records().cloned().collect();
        if let Some((size, limit)) = inner.store_full {
            if log_records
                .iter()
                .any(|r| matches!(r, PersistedRecord::Add(_)))
            {
                return Err(StoreError::PersistentStoreFull { size, limit });
            }
        }

        if !log_records.is_empty() {
            let frame = LogFrame::Commit {
                tx: batch.tx,
                records: log_records,
            };
            let start = inner.log_size;
            self.append_log(&mut inner, &frame)?;
            let synced = if batch.requires_sync() {
                Self::sync_log(&mut inner)
            } else {
                self.maybe_sync(&mut inner)
            };
            if let Err(e) = synced {
                error!(
                    target: "msgstore::persistence",
                    error = %e,
                    txn = ?batch.tx,
                    "Log sync failed; removing the commit frame"
                );
                Self::rewind_log(&mut inner, start);
                return Err(e);
            }
            inner.image.apply_frame(&frame);
        }

        let spill_records: Vec<PersistedRecord> = batch.spill_records().cloned().collect();
        if !spill_records.is_empty() {
            // Spilled records are discarded on restart, so a failure here
            // loses nothing the commit promised.
            if let Err(e) = Self::append_spill(&mut inner, batch.tx, spill_records) {
                warn!(target: "msgstore::persistence", error = %e, "Spill write failed");
            }
        }

        self.checkpoint_if_needed(&mut inner);
        Ok(())
    }

    fn reserve_ids(&self, generator: IdGeneratorKind, high_water: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.log.is_none() {
            return Err(StoreError::persistence("file persistence not started"));
        }
        let frame = LogFrame::Commit {
            tx: None,
            records: vec![PersistedRecord::IdReservation {
                generator,
                high_water,
            }],
        };
        self.append_log(&mut inner, &frame)?;
        Self::sync_log(&mut inner)?;
        inner.image.apply_frame(&frame);
        debug!(
            target: "msgstore::persistence",
            generator = generator.as_str(),
            high_water,
            "Reserved id block"
        );
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.unsynced {
            Self::sync_log(&mut inner)?;
        }
        if let Some(spill) = inner.spill.as_mut() {
            spill.sync_data()?;
        }
        Ok(())
    }

    fn stop(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.log.is_none() {
            return Ok(());
        }
        if inner.unsynced {
            Self::sync_log(&mut inner)?;
        }
        inner.log = None;
        inner.spill = None;
        inner.recovered = None;
        info!(
            target: "msgstore::persistence",
            appends = inner.counters.log_appends,
            syncs = inner.counters.sync_calls,
            checkpoints = inner.counters.checkpoints,
            "File persistence stopped"
        );
        Ok(())
    }

    fn counters(&self) -> PersistenceCounters {
        self.inner.lock().counters.clone()
    }
}

impl Drop for FileLogPersistence {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.unsynced {
            if let Some(log) = inner.log.as_mut() {
                let _ = log.sync_data();
            }
        }
    }
}
