use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::atomic::Ordering,
    time::Instant,
};

use bytes::Bytes;
use crossbeam::channel::Receiver;
use parking_lot::MutexGuard;

use crate::{
    compaction::Compaction,
    db::{
        filename::{parse_file_name, table_file_name, temp_table_file_name, FileType},
        format::{parse_internal_key, InternalKey, InternalKeyComparator, SeqNumber, ValueType, MAX_SEQ},
    },
    error::{Error, Result},
    iterator::DBIterator,
    memtable::MemTable,
    options::Options,
    table::TableBuilder,
    table_cache::TableCache,
    version::{FileMetaData, VersionEdit},
};

use super::{DBInner, DbState};

/// Work for the background thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BgTask {
    /// Write the sealed memtable to a table.
    Flush,
    /// Run a compaction picked by score or requested manually.
    Compact,
    Shutdown,
}

/// A compaction requested through `DB::compact_range`, run one piece at a time.
pub(crate) struct ManualCompaction {
    pub(crate) level: usize,
    pub(crate) begin: Option<InternalKey>,
    pub(crate) end: Option<InternalKey>,
    pub(crate) done: bool,
}

/// Work done by compactions producing files of one level.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CompactionStats {
    pub(crate) micros: u64,
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
}

impl CompactionStats {
    fn add(&mut self, micros: u64, bytes_read: u64, bytes_written: u64) {
        self.micros += micros;
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

/// Writes the content of `iter` to the table file `number`.
///
/// The table is written to a temporary name and renamed once complete and synced, then
/// opened once to make sure it's usable. Returns `None` when `iter` is empty.
pub(crate) fn build_table(
    db_path: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache,
    iter: &mut dyn DBIterator,
    number: u64,
) -> Result<Option<FileMetaData>> {
    iter.seek_to_first();
    if !iter.is_valid() {
        iter.status()?;
        return Ok(None);
    }

    let tmp_path = temp_table_file_name(db_path, number);
    let path = table_file_name(db_path, number);
    let guard = scopeguard::guard(tmp_path.clone(), |tmp_path| {
        let _ = fs::remove_file(tmp_path);
    });

    let mut builder = TableBuilder::new(options, icmp.clone(), File::create(&tmp_path)?);
    let smallest = InternalKey::decode_from(Bytes::copy_from_slice(iter.key()));
    let mut largest = Vec::new();
    while iter.is_valid() {
        largest.clear();
        largest.extend_from_slice(iter.key());
        builder.add(iter.key(), iter.value())?;
        iter.next();
    }
    iter.status()?;
    let file_size = builder.finish()?;
    drop(builder);

    fs::rename(&tmp_path, &path)?;
    scopeguard::ScopeGuard::into_inner(guard);

    if let Err(e) = table_cache.find_table(number, file_size) {
        let _ = fs::remove_file(&path);
        return Err(e);
    }

    Ok(Some(FileMetaData {
        number,
        file_size,
        smallest,
        largest: InternalKey::decode_from(Bytes::from(largest)),
    }))
}

/// A compaction output being written.
struct Output {
    number: u64,
    tmp_path: PathBuf,
    builder: TableBuilder,
    smallest: InternalKey,
    largest: Vec<u8>,
}

#[derive(Default)]
struct CompactionState {
    outputs: Vec<FileMetaData>,
    current: Option<Output>,
    // every number taken for an output, finished or not
    allocated: Vec<u64>,
}

impl CompactionState {
    fn abandon_current(&mut self) {
        if let Some(output) = self.current.take() {
            drop(output.builder);
            let _ = fs::remove_file(&output.tmp_path);
        }
    }
}

impl DBInner {
    pub(super) fn background_loop(&self, tasks: Receiver<BgTask>) {
        tracing::debug!("background thread started");
        for task in tasks {
            match task {
                BgTask::Shutdown => break,
                BgTask::Flush | BgTask::Compact => self.background_call(),
            }
        }
        tracing::debug!("background thread stopped");
    }

    /// Queues background work when some is needed and none is queued.
    pub(super) fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.bg_scheduled
            || self.shutting_down.load(Ordering::Acquire)
            || state.bg_error.is_some()
        {
            return;
        }

        let task = if state.imm.is_some() {
            BgTask::Flush
        } else if state.manual_compaction.as_ref().is_some_and(|m| !m.done)
            || state.versions.needs_compaction()
        {
            BgTask::Compact
        } else {
            return;
        };

        if self.bg_sender.send(task).is_ok() {
            state.bg_scheduled = true;
        }
    }

    fn background_call(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.bg_scheduled);

        if !self.shutting_down.load(Ordering::Acquire) && state.bg_error.is_none() {
            self.background_compaction(&mut state);
        }

        state.bg_scheduled = false;
        // the last run may have produced too many files in some level
        self.maybe_schedule_compaction(&mut state);
        self.bg_cv.notify_all();
    }

    fn background_compaction(&self, guard: &mut MutexGuard<'_, DbState>) {
        if guard.imm.is_some() {
            if let Err(e) = self.compact_memtable(guard) {
                self.record_background_error(guard, &e);
            }
            return;
        }

        let state = &mut **guard;
        let manual = state.manual_compaction.as_mut().filter(|m| !m.done);
        let is_manual = manual.is_some();
        let c = match manual {
            Some(m) => {
                let c = state
                    .versions
                    .compact_range(m.level, m.begin.as_ref(), m.end.as_ref());
                match &c {
                    // continue after the last compacted key next time
                    Some(c) => m.begin = c.inputs[0].last().map(|f| f.largest.clone()),
                    None => m.done = true,
                }
                c
            }
            None => state.versions.pick_compaction(),
        };

        let Some(mut c) = c else {
            return;
        };

        if !is_manual && c.is_trivial_move() {
            let level = c.level();
            let f = c.inputs[0][0].clone();
            let edit = c.edit_mut();
            edit.delete_file(level, f.number);
            edit.add_file(
                level + 1,
                f.number,
                f.file_size,
                f.smallest.clone(),
                f.largest.clone(),
            );
            let mut edit = c.into_edit();
            match guard.versions.log_and_apply(&mut edit) {
                Ok(()) => tracing::info!(
                    "moved #{} to level-{} {} bytes: {}",
                    f.number,
                    level + 1,
                    f.file_size,
                    guard.versions.level_summary()
                ),
                Err(e) => self.record_background_error(guard, &e),
            }
            return;
        }

        if let Err(e) = self.do_compaction_work(guard, c) {
            if !matches!(e, Error::ShutDown) {
                self.record_background_error(guard, &e);
            }
        }
        self.delete_obsolete_files(guard);
    }

    /// Writes the sealed memtable to a table and installs it.
    pub(super) fn compact_memtable(&self, guard: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let Some(imm) = guard.imm.clone() else {
            return Ok(());
        };

        let mut edit = VersionEdit::default();
        self.write_level0_table(guard, &imm, &mut edit)?;
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }

        // logs before the current one are no longer needed
        edit.set_prev_log_number(0);
        edit.set_log_number(guard.log_number);
        guard.versions.log_and_apply(&mut edit)?;

        guard.imm = None;
        self.has_imm.store(false, Ordering::Release);
        self.delete_obsolete_files(guard);
        Ok(())
    }

    fn write_level0_table(
        &self,
        guard: &mut MutexGuard<'_, DbState>,
        mem: &MemTable,
        edit: &mut VersionEdit,
    ) -> Result<()> {
        let start = Instant::now();
        let number = guard.versions.new_file_number();
        guard.pending_outputs.insert(number);
        let base = guard.versions.current();
        tracing::info!("level-0 table #{}: started", number);

        let result = MutexGuard::unlocked(guard, || {
            build_table(
                &self.db_path,
                &self.options,
                &self.icmp,
                &self.table_cache,
                &mut mem.iter(),
                number,
            )
        });
        guard.pending_outputs.remove(&number);
        let meta = result?;

        let Some(meta) = meta else {
            tracing::info!("level-0 table #{}: empty", number);
            return Ok(());
        };
        let level = base.pick_level_for_memtable_output(meta.smallest.user_key(), meta.largest.user_key());
        tracing::info!(
            "level-0 table #{}: {} bytes, placed at level {}",
            number,
            meta.file_size,
            level
        );
        guard.stats[level].add(start.elapsed().as_micros() as u64, 0, meta.file_size);
        edit.add_file(level, meta.number, meta.file_size, meta.smallest, meta.largest);
        Ok(())
    }

    fn do_compaction_work(&self, guard: &mut MutexGuard<'_, DbState>, mut c: Compaction) -> Result<()> {
        let start = Instant::now();
        let level = c.level();
        tracing::info!(
            "compacting {}@{} + {}@{} files",
            c.num_input_files(0),
            level,
            c.num_input_files(1),
            level + 1
        );
        debug_assert!(guard.versions.num_level_files(level) > 0);

        let smallest_snapshot = self
            .snapshots
            .oldest()
            .unwrap_or_else(|| guard.versions.last_sequence());
        let mut input = guard.versions.make_input_iterator(&c);

        let mut compact = CompactionState::default();
        let result = MutexGuard::unlocked(guard, || {
            self.merge_inputs(&mut c, input.as_mut(), smallest_snapshot, &mut compact)
        });
        compact.abandon_current();
        for number in &compact.allocated {
            guard.pending_outputs.remove(number);
        }
        result?;

        let bytes_written: u64 = compact.outputs.iter().map(|f| f.file_size).sum();
        guard.stats[level + 1].add(
            start.elapsed().as_micros() as u64,
            c.input_bytes(),
            bytes_written,
        );
        tracing::info!(
            "compacted {}@{} + {}@{} files => {} bytes in {} files",
            c.num_input_files(0),
            level,
            c.num_input_files(1),
            level + 1,
            bytes_written,
            compact.outputs.len()
        );

        c.add_input_deletions();
        for f in compact.outputs {
            c.edit_mut()
                .add_file(level + 1, f.number, f.file_size, f.smallest, f.largest);
        }
        let mut edit = c.into_edit();
        guard.versions.log_and_apply(&mut edit)?;
        tracing::info!("compacted to: {}", guard.versions.level_summary());
        Ok(())
    }

    /// The merge loop of a compaction, runs without the state lock.
    fn merge_inputs(
        &self,
        c: &mut Compaction,
        input: &mut dyn DBIterator,
        smallest_snapshot: SeqNumber,
        compact: &mut CompactionState,
    ) -> Result<()> {
        let ucmp = self.icmp.user_comparator().clone();
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQ;
        // the current output is finished before the next user key
        let mut cut_pending = false;

        input.seek_to_first();
        while input.is_valid() {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShutDown);
            }

            // a full memtable blocks writers, flush it first
            if self.has_imm.load(Ordering::Acquire) {
                let mut state = self.state.lock();
                self.compact_memtable(&mut state)?;
                self.bg_cv.notify_all();
            }

            let key = input.key();
            if c.should_stop_before(key) {
                cut_pending = true;
            }

            let mut drop = false;
            match parse_internal_key(key) {
                None => {
                    // keep corrupted keys, don't hide anything behind them
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQ;
                }
                Some(ikey) => {
                    let new_user_key = current_user_key
                        .as_deref()
                        .map_or(true, |k| ucmp.compare(ikey.user_key, k).is_ne());
                    if new_user_key {
                        if cut_pending && compact.current.is_some() {
                            self.finish_output(compact, input)?;
                        }
                        cut_pending = false;
                        current_user_key = Some(ikey.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQ;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // shadowed by a newer entry no snapshot reads past
                        drop = true;
                    } else if ikey.value_type == ValueType::Deletion
                        && ikey.seq <= smallest_snapshot
                        && c.is_base_level_for_key(ikey.user_key)
                    {
                        // Nothing older is left below, and the older entries of this
                        // level are dropped by the rule above.
                        drop = true;
                    }
                    last_sequence_for_key = ikey.seq;
                }
            }

            if !drop {
                if compact.current.is_none() {
                    self.open_output(compact, key)?;
                }
                if let Some(output) = compact.current.as_mut() {
                    output.builder.add(key, input.value())?;
                    output.largest.clear();
                    output.largest.extend_from_slice(key);
                    if output.builder.file_size() >= c.max_output_file_size() {
                        cut_pending = true;
                    }
                }
            }

            input.next();
        }

        input.status()?;
        if compact.current.is_some() {
            self.finish_output(compact, input)?;
        }
        Ok(())
    }

    fn open_output(&self, compact: &mut CompactionState, first_key: &[u8]) -> Result<()> {
        let number = {
            let mut state = self.state.lock();
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        compact.allocated.push(number);

        let tmp_path = temp_table_file_name(&self.db_path, number);
        let file = File::create(&tmp_path)?;
        compact.current = Some(Output {
            number,
            tmp_path,
            builder: TableBuilder::new(&self.options, self.icmp.clone(), file),
            smallest: InternalKey::decode_from(Bytes::copy_from_slice(first_key)),
            largest: Vec::new(),
        });
        Ok(())
    }

    fn finish_output(&self, compact: &mut CompactionState, input: &dyn DBIterator) -> Result<()> {
        let Some(mut output) = compact.current.take() else {
            return Ok(());
        };

        let finished = input.status().and_then(|_| output.builder.finish());
        let file_size = match finished {
            Ok(size) => size,
            Err(e) => {
                compact.current = Some(output);
                return Err(e);
            }
        };
        let entries = output.builder.entries_count();
        drop(output.builder);

        let path = table_file_name(&self.db_path, output.number);
        if let Err(e) = fs::rename(&output.tmp_path, &path) {
            let _ = fs::remove_file(&output.tmp_path);
            return Err(e.into());
        }
        // make sure the new table is usable
        self.table_cache.find_table(output.number, file_size)?;
        tracing::info!(
            "generated table #{}: {} keys, {} bytes",
            output.number,
            entries,
            file_size
        );

        compact.outputs.push(FileMetaData {
            number: output.number,
            file_size,
            smallest: output.smallest,
            largest: InternalKey::decode_from(Bytes::from(output.largest)),
        });
        Ok(())
    }

    /// Deletes the files no longer needed: tables no live version references, logs older
    /// than the manifest's log number, older manifests and leftover temporary files.
    pub(super) fn delete_obsolete_files(&self, state: &mut DbState) {
        if state.bg_error.is_some() {
            // after a failed write the new state of the manifest is unknown
            return;
        }

        let mut live = state.pending_outputs.clone();
        live.extend(state.versions.live_files());
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let entries = match fs::read_dir(&self.db_path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("list {:?}: {}", self.db_path, e);
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(file_type) = parse_file_name(&name.to_string_lossy()) else {
                continue;
            };
            let keep = match file_type {
                FileType::Log(number) => number >= log_number || number == prev_log_number,
                // the current manifest or a newer one being written
                FileType::Manifest(number) => number >= manifest_number,
                FileType::Table(number) | FileType::TempTable(number) => live.contains(&number),
                // CURRENT is replaced under the lock, a leftover is from a crash
                FileType::Temp(_) => false,
                FileType::Current | FileType::Lock => true,
            };
            if keep {
                continue;
            }

            if let FileType::Table(number) = file_type {
                self.table_cache.evict(number);
            }
            tracing::info!("delete {:?}", file_type);
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!("delete {:?}: {}", entry.path(), e);
            }
        }
    }
}
