mod compact;

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    db::{
        db_iter::DBIter,
        filename::{
            current_file_name, lock_file_name, log_file_name, parse_file_name, table_file_name,
            FileType,
        },
        format::{
            InternalKey, InternalKeyComparator, LookupKey, SeqNumber, ValueType, MAX_SEQ,
            VALUE_TYPE_FOR_SEEK,
        },
        wal::{LogReader, LogWriter},
    },
    error::{Error, Result},
    iterator::{BoxedIterator, MergingIterator},
    memtable::{LookupResult, MemTable},
    options::{Options, ReadOptions, WriteOptions},
    snapshot::{Snapshot, SnapshotList},
    table_cache::TableCache,
    utils::file_lock::FileLock,
    version::{
        VersionEdit, VersionSet, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, NUM_LEVELS,
    },
    write_batch::WriteBatch,
};

use compact::{build_table, BgTask, CompactionStats, ManualCompaction};

/// A key range `[start, limit)` in user keys.
#[derive(Debug, Clone, Copy)]
pub struct Range<'a> {
    pub start: &'a [u8],
    pub limit: &'a [u8],
}

impl<'a> Range<'a> {
    pub fn new(start: &'a [u8], limit: &'a [u8]) -> Self {
        Self { start, limit }
    }
}

/// Serializes writers, owns the log being appended to.
struct Writer {
    log: LogWriter,
}

/// Everything guarded by the state lock.
pub(crate) struct DbState {
    mem: MemTable,
    /// Sealed memtable waiting to be flushed.
    imm: Option<MemTable>,
    /// Number of the log `mem` is backed by.
    log_number: u64,
    versions: VersionSet,

    /// A task is queued for or running on the background thread.
    bg_scheduled: bool,
    bg_error: Option<Error>,
    /// Table files being written that no version references yet.
    pending_outputs: HashSet<u64>,
    manual_compaction: Option<ManualCompaction>,
    stats: [CompactionStats; NUM_LEVELS],
}

pub(crate) struct DBInner {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    snapshots: Arc<SnapshotList>,

    writer: Mutex<Writer>,
    state: Mutex<DbState>,
    /// Signalled when background work finishes.
    bg_cv: Condvar,
    bg_sender: Sender<BgTask>,
    shutting_down: AtomicBool,
    has_imm: AtomicBool,

    lock: FileLock,
}

/// An embedded, ordered key-value store.
///
/// A handle is `Send + Sync`. Writes are serialized internally, reads run concurrently
/// with writes and with background compaction.
pub struct DB {
    inner: Arc<DBInner>,
    bg_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DB {
    /// Opens the database at `path`, recovering any data left in its logs.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let options = Arc::new(options);
        tracing::info!("opening database {:?} with {:?}", db_path, options);

        fs::create_dir_all(&db_path)?;
        let lock = FileLock::acquire(lock_file_name(&db_path))?;

        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let table_cache = Arc::new(TableCache::new(&db_path, &options, icmp.clone()));
        let mut versions = VersionSet::new(&db_path, options.clone(), table_cache.clone());

        if !current_file_name(&db_path).exists() {
            if !options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "{:?} does not exist (create_if_missing is false)",
                    db_path
                )));
            }
            tracing::info!("creating database {:?}", db_path);
            VersionSet::create_new_db(&db_path, options.comparator.as_ref())?;
        } else if options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{:?} exists (error_if_exists is true)",
                db_path
            )));
        }

        versions.recover()?;
        let mut edit = VersionEdit::default();
        recover_logs(&db_path, &options, &icmp, &table_cache, &mut versions, &mut edit)?;

        let log_number = versions.new_file_number();
        let log = LogWriter::create(log_file_name(&db_path, log_number))?;
        edit.set_prev_log_number(0);
        edit.set_log_number(log_number);
        versions.log_and_apply(&mut edit)?;

        let (bg_sender, bg_receiver) = crossbeam::channel::unbounded();
        let inner = Arc::new(DBInner {
            db_path,
            options,
            icmp: icmp.clone(),
            table_cache,
            snapshots: SnapshotList::new(),
            writer: Mutex::new(Writer { log }),
            state: Mutex::new(DbState {
                mem: MemTable::new(icmp),
                imm: None,
                log_number,
                versions,
                bg_scheduled: false,
                bg_error: None,
                pending_outputs: HashSet::new(),
                manual_compaction: None,
                stats: Default::default(),
            }),
            bg_cv: Condvar::new(),
            bg_sender,
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            lock,
        });

        let bg_thread = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("arisdb-bg".to_string())
                .spawn(move || inner.background_loop(bg_receiver))?
        };

        {
            let mut state = inner.state.lock();
            inner.delete_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
            tracing::info!("database opened: {}", state.versions.level_summary());
        }

        Ok(Self {
            inner,
            bg_thread: Mutex::new(Some(bg_thread)),
        })
    }

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    /// Removes `key`. Deleting a missing key is not an error.
    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Applies `batch` atomically: readers see all of its updates or none.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, batch)
    }

    /// The value of `key`, `None` if it's missing or deleted.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(options, key)
    }

    /// An iterator over the user-visible state, as of `options.snapshot` or now.
    ///
    /// The iterator starts unpositioned, call one of the seek methods first.
    pub fn new_iterator(&self, options: &ReadOptions) -> DBIter {
        self.inner.new_iterator(options)
    }

    pub fn get_snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        self.inner
            .snapshots
            .acquire(state.versions.last_sequence())
    }

    /// Same as dropping the snapshot.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Approximate file system space used by each range. Data still in memory is not
    /// counted.
    pub fn get_approximate_sizes(&self, ranges: &[Range<'_>]) -> Vec<u64> {
        let current = self.inner.state.lock().versions.current();
        ranges
            .iter()
            .map(|range| {
                let start = InternalKey::new(range.start, MAX_SEQ, VALUE_TYPE_FOR_SEEK);
                let limit = InternalKey::new(range.limit, MAX_SEQ, VALUE_TYPE_FOR_SEEK);
                let start = current.approximate_offset_of(start.as_slice());
                let limit = current.approximate_offset_of(limit.as_slice());
                limit.saturating_sub(start)
            })
            .collect()
    }

    /// Compacts every table overlapping `[begin, end]`, `None` meaning unbounded. Deleted
    /// and overwritten data in the range is discarded.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Introspection. Known properties:
    ///
    /// - `arisdb.num-files-at-level<N>`
    /// - `arisdb.stats`
    /// - `arisdb.sstables`
    /// - `arisdb.approximate-memory-usage`
    pub fn get_property(&self, property: &str) -> Option<String> {
        self.inner.get_property(property)
    }

    /// Waits for background work to stop and releases the database.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.bg_thread.lock().take() else {
            return Ok(());
        };

        self.inner.shutting_down.store(true, Ordering::Release);
        let _ = self.inner.bg_sender.send(BgTask::Shutdown);
        if handle.join().is_err() {
            tracing::error!("background thread panicked");
        }
        self.inner.bg_cv.notify_all();

        let mut writer = self.inner.writer.lock();
        writer.log.flush()?;
        tracing::info!("database closed, released {:?}", self.inner.lock.path());
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("close database: {}", e);
        }
    }
}

impl DBInner {
    fn write(&self, options: &WriteOptions, mut batch: WriteBatch) -> Result<()> {
        let mut writer = self.writer.lock();
        self.make_room_for_write(&mut writer, false)?;
        if batch.is_empty() {
            return Ok(());
        }

        let (last_sequence, mem) = {
            let state = self.state.lock();
            (state.versions.last_sequence(), state.mem.clone())
        };
        batch.set_sequence(last_sequence + 1);
        let last = last_sequence + batch.count() as SeqNumber;

        let logged = writer.log.add_record(batch.contents()).and_then(|_| {
            if options.sync {
                writer.log.sync()
            } else {
                writer.log.flush()
            }
        });
        if let Err(e) = logged {
            // The log may hold a partial record now, later writes would be lost behind it.
            let mut state = self.state.lock();
            self.record_background_error(&mut state, &e);
            return Err(e);
        }

        batch.insert_into(&mem)?;

        // publish, the batch becomes visible at once
        self.state.lock().versions.set_last_sequence(last);
        Ok(())
    }

    /// Makes sure the memtable has room for a write, switching to a new memtable and log
    /// when it's full. `force` switches even when there's room left.
    fn make_room_for_write(&self, writer: &mut MutexGuard<'_, Writer>, mut force: bool) -> Result<()> {
        let mut allow_delay = !force;
        let mut state = self.state.lock();

        loop {
            if let Some(e) = &state.bg_error {
                return Err(e.duplicate());
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShutDown);
            }

            let level0_files = state.versions.num_level_files(0);
            if allow_delay && level0_files >= L0_SLOWDOWN_WRITES_TRIGGER {
                // Close to the hard limit. Delay this write once by a little, handing the
                // CPU to the compaction thread, instead of stalling for seconds later.
                MutexGuard::unlocked(&mut state, || std::thread::sleep(Duration::from_millis(1)));
                allow_delay = false;
            } else if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                break;
            } else if force && state.imm.is_none() && state.mem.is_empty() {
                break;
            } else if state.imm.is_some() {
                tracing::info!("current memtable full, waiting for the flush");
                self.bg_cv.wait(&mut state);
            } else if level0_files >= L0_STOP_WRITES_TRIGGER {
                tracing::info!("too many level-0 files ({}), waiting", level0_files);
                self.bg_cv.wait(&mut state);
            } else {
                let number = state.versions.new_file_number();
                let log = match LogWriter::create(log_file_name(&self.db_path, number)) {
                    Ok(log) => log,
                    Err(e) => {
                        state.versions.reuse_file_number(number);
                        return Err(e);
                    }
                };
                writer.log.flush()?;
                writer.log = log;

                let mem = std::mem::replace(&mut state.mem, MemTable::new(self.icmp.clone()));
                tracing::info!(
                    "memtable full ({} bytes), switched to log #{}",
                    mem.approximate_memory_usage(),
                    number
                );
                state.imm = Some(mem);
                state.log_number = number;
                self.has_imm.store(true, Ordering::Release);
                force = false;
                self.maybe_schedule_compaction(&mut state);
            }
        }
        Ok(())
    }

    fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Bytes>> {
        let (mem, imm, current, sequence) = {
            let state = self.state.lock();
            let sequence = match &options.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (
                state.mem.clone(),
                state.imm.clone(),
                state.versions.current(),
                sequence,
            )
        };

        let lookup = LookupKey::new(key, sequence);
        let result = match mem.get(&lookup) {
            Some(result) => Some(result),
            None => match imm.and_then(|imm| imm.get(&lookup)) {
                Some(result) => Some(result),
                None => current.get(options, &lookup)?,
            },
        };

        Ok(match result {
            Some(LookupResult::Found(value)) => Some(value),
            Some(LookupResult::Deleted) | None => None,
        })
    }

    fn new_iterator(&self, options: &ReadOptions) -> DBIter {
        let mut iters: Vec<BoxedIterator> = vec![];
        let (current, sequence) = {
            let state = self.state.lock();
            iters.push(Box::new(state.mem.iter()));
            if let Some(imm) = &state.imm {
                iters.push(Box::new(imm.iter()));
            }
            let sequence = match &options.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (state.versions.current(), sequence)
        };

        current.add_iterators(options, &mut iters);
        let internal = MergingIterator::new(Arc::new(self.icmp.clone()), iters);
        DBIter::new(
            self.options.comparator.clone(),
            Box::new(internal),
            sequence,
            Some(current),
            options.snapshot.clone(),
        )
    }

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let max_level_with_files = {
            let state = self.state.lock();
            let current = state.versions.current();
            (1..NUM_LEVELS)
                .filter(|&level| current.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };

        self.flush_memtable()?;
        for level in 0..max_level_with_files {
            self.compact_level_range(level, begin, end)?;
        }
        Ok(())
    }

    /// Seals the memtable and waits until it's written to a table.
    fn flush_memtable(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock();
            self.make_room_for_write(&mut writer, true)?;
        }

        let mut state = self.state.lock();
        while state.imm.is_some() && state.bg_error.is_none() {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShutDown);
            }
            self.bg_cv.wait(&mut state);
        }
        match &state.bg_error {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }

    fn compact_level_range(&self, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        debug_assert!(level + 1 < NUM_LEVELS);
        let begin = begin.map(|k| InternalKey::new(k, MAX_SEQ, VALUE_TYPE_FOR_SEEK));
        let end = end.map(|k| InternalKey::new(k, 0, ValueType::Deletion));

        let mut state = self.state.lock();
        // one manual compaction at a time
        while state.manual_compaction.is_some() {
            self.bg_cv.wait(&mut state);
        }
        state.manual_compaction = Some(ManualCompaction {
            level,
            begin,
            end,
            done: false,
        });

        let result = loop {
            if let Some(e) = &state.bg_error {
                break Err(e.duplicate());
            }
            if self.shutting_down.load(Ordering::Acquire) {
                break Err(Error::ShutDown);
            }
            if state.manual_compaction.as_ref().is_some_and(|m| m.done) {
                break Ok(());
            }
            self.maybe_schedule_compaction(&mut state);
            self.bg_cv.wait(&mut state);
        };

        state.manual_compaction = None;
        self.bg_cv.notify_all();
        result
    }

    fn get_property(&self, property: &str) -> Option<String> {
        let property = property.strip_prefix("arisdb.")?;
        let state = self.state.lock();

        if let Some(level) = property.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            return (level < NUM_LEVELS).then(|| state.versions.num_level_files(level).to_string());
        }

        match property {
            "stats" => {
                let mut out = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for (level, stats) in state.stats.iter().enumerate() {
                    let files = state.versions.num_level_files(level);
                    if stats.micros > 0 || files > 0 {
                        out.push_str(&format!(
                            "{:>3} {:>8} {:>8.0} {:>9.0} {:>8.0} {:>9.0}\n",
                            level,
                            files,
                            state.versions.num_level_bytes(level) as f64 / 1048576.0,
                            stats.micros as f64 / 1e6,
                            stats.bytes_read as f64 / 1048576.0,
                            stats.bytes_written as f64 / 1048576.0
                        ));
                    }
                }
                Some(out)
            }
            "sstables" => Some(state.versions.current().debug_string()),
            "approximate-memory-usage" => {
                let mut total = state.mem.approximate_memory_usage();
                if let Some(imm) = &state.imm {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    /// Keeps the first background error, later writes and compactions fail with it.
    fn record_background_error(&self, state: &mut DbState, e: &Error) {
        if state.bg_error.is_none() {
            tracing::error!("background error: {}", e);
            state.bg_error = Some(match e {
                Error::BackgroundError(_) => e.duplicate(),
                other => Error::BackgroundError(other.to_string()),
            });
            self.bg_cv.notify_all();
        }
    }
}

/// Replays the logs not yet covered by the manifest into level-0 tables, recorded in
/// `edit`.
fn recover_logs(
    db_path: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
) -> Result<()> {
    let min_log = versions.log_number();
    let prev_log = versions.prev_log_number();
    let mut expected = versions.live_files();

    let mut logs = vec![];
    for entry in fs::read_dir(db_path)? {
        let entry = entry?;
        let name = entry.file_name();
        match parse_file_name(&name.to_string_lossy()) {
            Some(FileType::Table(number)) => {
                expected.remove(&number);
            }
            Some(FileType::Log(number)) if number >= min_log || number == prev_log => {
                logs.push(number);
            }
            _ => {}
        }
    }

    if !expected.is_empty() {
        let mut missing: Vec<_> = expected.into_iter().collect();
        missing.sort_unstable();
        return Err(Error::Corruption(format!(
            "{} missing files, e.g. {:?}",
            missing.len(),
            table_file_name(db_path, missing[0])
        )));
    }

    logs.sort_unstable();
    let mut max_sequence = versions.last_sequence();
    for number in logs {
        recover_log_file(
            db_path,
            options,
            icmp,
            table_cache,
            versions,
            number,
            edit,
            &mut max_sequence,
        )?;
        // The previous incarnation may not have written a manifest recording this log.
        versions.mark_file_number_used(number);
    }

    if versions.last_sequence() < max_sequence {
        versions.set_last_sequence(max_sequence);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn recover_log_file(
    db_path: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache,
    versions: &mut VersionSet,
    log_number: u64,
    edit: &mut VersionEdit,
    max_sequence: &mut SeqNumber,
) -> Result<()> {
    let path = log_file_name(db_path, log_number);
    tracing::info!("recovering log #{}", log_number);

    let mut reader = LogReader::open(&path, options.paranoid_checks)?;
    let mut mem = MemTable::new(icmp.clone());
    let mut records = 0;

    while let Some(record) = reader.read_record()? {
        let batch = match WriteBatch::decode_from(&record) {
            Ok(batch) => batch,
            Err(e) if !options.paranoid_checks => {
                tracing::warn!("log #{}: skipping bad record: {}", log_number, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        batch.insert_into(&mem)?;
        records += 1;

        let last = batch.sequence() + batch.count() as SeqNumber - 1;
        if batch.count() > 0 && last > *max_sequence {
            *max_sequence = last;
        }

        if mem.approximate_memory_usage() > options.write_buffer_size {
            flush_recovered(db_path, options, icmp, table_cache, versions, &mem, edit)?;
            mem = MemTable::new(icmp.clone());
        }
    }

    if reader.dropped_bytes() > 0 {
        tracing::warn!(
            "log #{}: dropped {} bytes of corrupted data",
            log_number,
            reader.dropped_bytes()
        );
    }
    tracing::info!("log #{}: {} records recovered", log_number, records);

    if !mem.is_empty() {
        flush_recovered(db_path, options, icmp, table_cache, versions, &mem, edit)?;
    }
    Ok(())
}

fn flush_recovered(
    db_path: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache,
    versions: &mut VersionSet,
    mem: &MemTable,
    edit: &mut VersionEdit,
) -> Result<()> {
    let number = versions.new_file_number();
    let meta = build_table(db_path, options, icmp, table_cache, &mut mem.iter(), number)?;
    if let Some(meta) = meta {
        tracing::info!(
            "level-0 table #{}: {} bytes from recovered log",
            meta.number,
            meta.file_size
        );
        // Several recovered tables may overlap each other, so they all go to level 0.
        edit.add_file(0, meta.number, meta.file_size, meta.smallest, meta.largest);
    }
    Ok(())
}

/// Deletes every file of the database at `path`. The database must not be open.
pub fn destroy_db(path: impl AsRef<Path>, _options: &Options) -> Result<()> {
    let db_path = path.as_ref();
    let entries = match fs::read_dir(db_path) {
        Ok(entries) => entries,
        // nothing to destroy
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let lock_path = lock_file_name(db_path);
    let lock = FileLock::acquire(&lock_path)?;

    let mut result = Ok(());
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        match parse_file_name(&name.to_string_lossy()) {
            Some(FileType::Lock) | None => {}
            Some(_) => {
                if let Err(e) = fs::remove_file(entry.path()) {
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }
    }

    drop(lock);
    let _ = fs::remove_file(&lock_path);
    // fails when the directory holds unrelated files, which are left alone
    let _ = fs::remove_dir(db_path);
    tracing::info!("destroyed database {:?}", db_path);
    result
}
