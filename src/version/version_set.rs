use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use crate::{
    comparator::Comparator,
    compaction::{key_range, Compaction},
    db::{
        filename::{current_file_name, manifest_file_name, set_current_file},
        format::{InternalKey, InternalKeyComparator, SeqNumber},
        wal::{LogReader, LogWriter},
    },
    error::{Error, Result},
    iterator::{BoxedIterator, MergingIterator},
    options::{Options, ReadOptions},
    table_cache::TableCache,
};

use super::{
    expanded_compaction_byte_size_limit, new_level_iterator, total_file_size, FileMetaData,
    Version, VersionEdit, NUM_LEVELS,
};

#[derive(Default)]
struct LevelState {
    deleted_files: HashSet<u64>,
    added_files: Vec<Arc<FileMetaData>>,
}

/// Accumulates a sequence of edits on top of a base version.
pub(crate) struct VersionBuilder {
    base: Arc<Version>,
    levels: [LevelState; NUM_LEVELS],
}

impl VersionBuilder {
    pub(crate) fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            levels: std::array::from_fn(|_| LevelState::default()),
        }
    }

    /// Applies `edit`, recording its compaction pointers in `compact_pointers`.
    pub(crate) fn apply(
        &mut self,
        edit: &VersionEdit,
        compact_pointers: &mut [Option<InternalKey>; NUM_LEVELS],
    ) {
        for (level, key) in &edit.compact_pointers {
            compact_pointers[*level] = Some(key.clone());
        }

        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted_files.insert(*number);
        }

        for (level, f) in &edit.new_files {
            self.levels[*level].deleted_files.remove(&f.number);
            self.levels[*level].added_files.push(Arc::new(f.clone()));
        }
    }

    pub(crate) fn save_to(&self) -> Version {
        let icmp = self.base.icmp.clone();
        let mut v = Version::new(
            self.base.options.clone(),
            icmp.clone(),
            self.base.table_cache.clone(),
        );

        for (level, delta) in self.levels.iter().enumerate() {
            let files = &mut v.files[level];
            files.extend(
                self.base.files[level]
                    .iter()
                    .chain(delta.added_files.iter())
                    .filter(|f| !delta.deleted_files.contains(&f.number))
                    .cloned(),
            );
            files.sort_by(|a, b| {
                icmp.compare(a.smallest.as_slice(), b.smallest.as_slice())
                    .then(a.number.cmp(&b.number))
            });

            if level > 0 {
                debug_assert!(
                    files.windows(2).all(|w| icmp
                        .compare(w[0].largest.as_slice(), w[1].smallest.as_slice())
                        .is_lt()),
                    "overlapping ranges in level {level}"
                );
            }
        }
        v
    }
}

/// Owns the current version, the manifest and the file number counters.
pub(crate) struct VersionSet {
    db_path: PathBuf,
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SeqNumber,
    log_number: u64,
    // only kept for manifests written by older engines
    prev_log_number: u64,

    manifest: Option<LogWriter>,
    current: Arc<Version>,
    // every version handed out, dead entries are pruned on install
    versions: Vec<Weak<Version>>,

    // per level key at which the next compaction of that level starts
    compact_pointers: [Option<InternalKey>; NUM_LEVELS],
}

impl VersionSet {
    pub(crate) fn new(db_path: &Path, options: Arc<Options>, table_cache: Arc<TableCache>) -> Self {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let current = Arc::new(Version::new(
            options.clone(),
            icmp.clone(),
            table_cache.clone(),
        ));
        Self {
            db_path: db_path.to_path_buf(),
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            manifest: None,
            versions: vec![Arc::downgrade(&current)],
            current,
            compact_pointers: std::array::from_fn(|_| None),
        }
    }

    pub(crate) fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    pub(crate) fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Gives back a number from `new_file_number` that ended up unused.
    pub(crate) fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub(crate) fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub(crate) fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub(crate) fn log_number(&self) -> u64 {
        self.log_number
    }

    pub(crate) fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub(crate) fn last_sequence(&self) -> SeqNumber {
        self.last_sequence
    }

    pub(crate) fn set_last_sequence(&mut self, seq: SeqNumber) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub(crate) fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    pub(crate) fn num_level_bytes(&self, level: usize) -> u64 {
        self.current.level_bytes(level)
    }

    pub(crate) fn needs_compaction(&self) -> bool {
        self.current.compaction_score() >= 1.0
    }

    /// Writes the initial manifest of an empty database and points `CURRENT` at it.
    pub(crate) fn create_new_db(db_path: &Path, comparator: &dyn Comparator) -> Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name(comparator.name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = manifest_file_name(db_path, 1);
        let written = (|| -> Result<()> {
            let mut writer = LogWriter::create(&manifest)?;
            writer.add_record(&edit.encode())?;
            writer.sync()
        })()
        .and_then(|_| set_current_file(db_path, 1));

        if written.is_err() {
            let _ = fs::remove_file(&manifest);
        }
        written
    }

    /// Rebuilds the current version from the manifest named by `CURRENT`.
    ///
    /// The manifest is not appended to afterwards, the next `log_and_apply` starts a new
    /// one holding a snapshot of the recovered state.
    pub(crate) fn recover(&mut self) -> Result<()> {
        let current = fs::read_to_string(current_file_name(&self.db_path))?;
        let Some(manifest_name) = current.strip_suffix('\n') else {
            return Err(Error::Corruption(
                "CURRENT file does not end with newline".to_string(),
            ));
        };
        let manifest_path = self.db_path.join(manifest_name);
        tracing::info!("recovering from manifest {:?}", manifest_path);

        let mut reader = LogReader::open(&manifest_path, true)?;
        let mut builder = VersionBuilder::new(self.current.clone());
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator {
                let ours = self.icmp.user_comparator().name();
                if name != ours {
                    return Err(Error::InvalidArgument(format!(
                        "{ours} does not match existing comparator {name}"
                    )));
                }
            }

            builder.apply(&edit, &mut self.compact_pointers);
            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
        }

        let next_file_number = next_file_number
            .ok_or_else(|| Error::Corruption("no meta-nextfile entry in manifest".to_string()))?;
        let log_number = log_number
            .ok_or_else(|| Error::Corruption("no meta-lognumber entry in manifest".to_string()))?;
        let last_sequence = last_sequence.ok_or_else(|| {
            Error::Corruption("no last-sequence-number entry in manifest".to_string())
        })?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.next_file_number = next_file_number;
        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        let mut v = builder.save_to();
        v.finalize();
        self.append_version(v);

        self.manifest_file_number = self.new_file_number();
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.last_sequence = last_sequence;

        tracing::info!(
            "recovered manifest #{}: next file {}, log {}, last sequence {}, {}",
            manifest_name,
            self.next_file_number,
            self.log_number,
            self.last_sequence,
            self.level_summary()
        );
        Ok(())
    }

    /// Applies `edit` to the current version, persists it and installs the result as the
    /// new current version.
    ///
    /// The edit is synced to the manifest before the version is installed, so a version
    /// visible to readers always survives a crash.
    pub(crate) fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(number) => {
                debug_assert!(number >= self.log_number);
                debug_assert!(number < self.next_file_number);
            }
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut builder = VersionBuilder::new(self.current.clone());
        builder.apply(edit, &mut self.compact_pointers);
        let mut v = builder.save_to();
        v.finalize();

        let new_manifest = match self.manifest {
            Some(_) => None,
            None => {
                let path = manifest_file_name(&self.db_path, self.manifest_file_number);
                tracing::info!("creating manifest {:?}", path);
                let mut writer = LogWriter::create(&path)?;
                let snapshot = self.write_snapshot(&mut writer);
                self.manifest = Some(writer);
                if let Err(e) = snapshot {
                    self.manifest = None;
                    let _ = fs::remove_file(&path);
                    return Err(e);
                }
                Some(path)
            }
        };

        if let Err(e) = self.write_edit(edit, new_manifest.is_some()) {
            tracing::error!("manifest write failed: {}", e);
            if let Some(path) = new_manifest {
                self.manifest = None;
                let _ = fs::remove_file(path);
            }
            return Err(e);
        }

        if let Some(number) = edit.log_number {
            self.log_number = number;
        }
        if let Some(number) = edit.prev_log_number {
            self.prev_log_number = number;
        }
        self.append_version(v);
        Ok(())
    }

    fn write_edit(&mut self, edit: &VersionEdit, new_manifest: bool) -> Result<()> {
        if let Some(writer) = self.manifest.as_mut() {
            writer.add_record(&edit.encode())?;
            writer.sync()?;
        }
        if new_manifest {
            set_current_file(&self.db_path, self.manifest_file_number)?;
        }
        Ok(())
    }

    /// Saves the full current state as the first record of a new manifest.
    fn write_snapshot(&self, writer: &mut LogWriter) -> Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name(self.icmp.user_comparator().name());

        for (level, key) in self.compact_pointers.iter().enumerate() {
            if let Some(key) = key {
                edit.set_compact_pointer(level, key.clone());
            }
        }

        for level in 0..NUM_LEVELS {
            for f in self.current.files(level) {
                edit.add_file(
                    level,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
            }
        }

        writer.add_record(&edit.encode())?;
        Ok(())
    }

    fn append_version(&mut self, v: Version) {
        let v = Arc::new(v);
        self.versions.retain(|w| w.strong_count() > 0);
        self.versions.push(Arc::downgrade(&v));
        self.current = v;
    }

    /// Numbers of the table files referenced by any version still in use.
    pub(crate) fn live_files(&self) -> HashSet<u64> {
        let mut live = HashSet::new();
        for v in self.versions.iter().filter_map(Weak::upgrade) {
            for level in 0..NUM_LEVELS {
                live.extend(v.files(level).iter().map(|f| f.number));
            }
        }
        live
    }

    pub(crate) fn level_summary(&self) -> String {
        let counts = (0..NUM_LEVELS)
            .map(|level| self.current.num_files(level).to_string())
            .collect::<Vec<_>>();
        format!("files[ {} ]", counts.join(" "))
    }

    /// Picks the level with the highest score and the files to compact there, `None` when
    /// no level needs compaction.
    pub(crate) fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current.clone();
        if current.compaction_score() < 1.0 {
            return None;
        }
        let level = current.compaction_level();
        debug_assert!(level + 1 < NUM_LEVELS);

        // first file past the previous compaction of this level, wrapping around
        let files = current.files(level);
        let picked = files
            .iter()
            .find(|f| match &self.compact_pointers[level] {
                Some(pointer) => self
                    .icmp
                    .compare(f.largest.as_slice(), pointer.as_slice())
                    .is_gt(),
                None => true,
            })
            .or_else(|| files.first())?
            .clone();

        let mut c = Compaction::new(&self.options, level, current.clone());
        c.inputs[0] = vec![picked];

        // level-0 files may overlap each other, take all of them that overlap the pick
        if level == 0 {
            let (smallest, largest) = key_range(&self.icmp, &c.inputs[0]);
            c.inputs[0] = current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// A compaction of the files of `level` overlapping `[begin, end]`, `None` when
    /// there are none.
    pub(crate) fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current.clone();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid compacting too much in one shot when the range is large. Level-0 files
        // overlap each other and must all be taken.
        if level > 0 {
            let limit = self.options.max_file_size as u64;
            let mut total = 0;
            if let Some(i) = inputs.iter().position(|f| {
                total += f.file_size;
                total >= limit
            }) {
                inputs.truncate(i + 1);
            }
        }

        let mut c = Compaction::new(&self.options, level, current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level();
        let current = c.input_version().clone();

        let (smallest, mut largest) = key_range(&self.icmp, &c.inputs[0]);
        c.inputs[1] = current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        let (mut all_start, mut all_limit) =
            key_range(&self.icmp, c.inputs[0].iter().chain(c.inputs[1].iter()));

        // Grow the inputs of `level` as long as that picks up no more files of
        // `level + 1`.
        if !c.inputs[1].is_empty() {
            let expanded0 = current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            let inputs0_size = total_file_size(&c.inputs[0]);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(&self.options)
            {
                let (new_start, new_limit) = key_range(&self.icmp, &expanded0);
                let expanded1 =
                    current.get_overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                if expanded1.len() == c.inputs[1].len() {
                    tracing::info!(
                        "expanding@{} {}+{} ({}+{} bytes) to {}+{} ({}+{} bytes)",
                        level,
                        c.inputs[0].len(),
                        c.inputs[1].len(),
                        inputs0_size,
                        inputs1_size,
                        expanded0.len(),
                        expanded1.len(),
                        expanded0_size,
                        inputs1_size
                    );
                    largest = new_limit;
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    (all_start, all_limit) =
                        key_range(&self.icmp, c.inputs[0].iter().chain(c.inputs[1].iter()));
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Advance the pointer now instead of when the edit is applied, so a failing
        // compaction is retried on a different key range.
        self.compact_pointers[level] = Some(largest.clone());
        c.edit_mut().set_compact_pointer(level, largest);
    }

    /// A merging iterator over every input of `c`.
    pub(crate) fn make_input_iterator(&self, c: &Compaction) -> BoxedIterator {
        let read_options = ReadOptions {
            snapshot: None,
            fill_cache: false,
            verify_checksums: self.options.paranoid_checks,
        };

        let mut list: Vec<BoxedIterator> = vec![];
        for (which, files) in c.inputs.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            if c.level() + which == 0 {
                for f in files {
                    list.push(
                        self.table_cache
                            .new_iterator(&read_options, f.number, f.file_size),
                    );
                }
            } else {
                list.push(Box::new(new_level_iterator(
                    self.icmp.clone(),
                    self.table_cache.clone(),
                    read_options.clone(),
                    files.clone(),
                )));
            }
        }
        Box::new(MergingIterator::new(Arc::new(self.icmp.clone()), list))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        comparator::{BytewiseComparator, Comparator},
        db::format::{InternalKey, InternalKeyComparator, ValueType},
        options::Options,
        table_cache::TableCache,
        version::{VersionEdit, NUM_LEVELS},
    };

    use super::VersionSet;

    struct ReverseComparator;

    impl Comparator for ReverseComparator {
        fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
            b.cmp(a)
        }

        fn name(&self) -> &str {
            "test.ReverseComparator"
        }

        fn find_shortest_separator(&self, start: &[u8], _limit: &[u8]) -> Vec<u8> {
            start.to_vec()
        }

        fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
            key.to_vec()
        }
    }

    fn open_set(path: &std::path::Path, options: Options) -> VersionSet {
        let options = Arc::new(options);
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let table_cache = Arc::new(TableCache::new(path, &options, icmp));
        VersionSet::new(path, options, table_cache)
    }

    fn ikey(key: &str, seq: u64) -> InternalKey {
        InternalKey::new(key.as_bytes(), seq, ValueType::Value)
    }

    #[test]
    fn recover_after_edits() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        VersionSet::create_new_db(dir.path(), &BytewiseComparator)?;

        {
            let mut vset = open_set(dir.path(), Options::default());
            vset.recover()?;
            assert_eq!(vset.manifest_file_number(), 2);

            let mut edit = VersionEdit::default();
            let number = vset.new_file_number();
            edit.add_file(0, number, 100, ikey("a", 1), ikey("c", 2));
            vset.set_last_sequence(2);
            vset.log_and_apply(&mut edit)?;

            let mut edit = VersionEdit::default();
            let number = vset.new_file_number();
            edit.add_file(2, number, 200, ikey("d", 3), ikey("f", 4));
            edit.set_log_number(vset.new_file_number());
            vset.set_last_sequence(4);
            vset.log_and_apply(&mut edit)?;
            assert_eq!(vset.level_summary(), "files[ 1 0 1 0 0 0 0 ]");
        }

        let mut vset = open_set(dir.path(), Options::default());
        vset.recover()?;
        let current = vset.current();
        assert_eq!(current.num_files(0), 1);
        assert_eq!(current.num_files(2), 1);
        assert_eq!(current.files(2)[0].file_size, 200);
        assert_eq!(current.files(2)[0].smallest, ikey("d", 3));
        assert_eq!(vset.last_sequence(), 4);
        assert_eq!(vset.log_number(), 5);
        assert!(vset.new_file_number() > 5);
        assert_eq!(vset.live_files().len(), 2);
        Ok(())
    }

    #[test]
    fn comparator_mismatch() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        VersionSet::create_new_db(dir.path(), &BytewiseComparator)?;

        let options = Options::builder().comparator(ReverseComparator).build();
        let mut vset = open_set(dir.path(), options);
        assert!(vset.recover().unwrap_err().is_invalid_argument());
        Ok(())
    }

    #[test]
    fn deleted_files_leave_version() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        VersionSet::create_new_db(dir.path(), &BytewiseComparator)?;
        let mut vset = open_set(dir.path(), Options::default());
        vset.recover()?;

        let mut edit = VersionEdit::default();
        edit.add_file(1, 10, 100, ikey("a", 1), ikey("b", 1));
        edit.add_file(1, 11, 100, ikey("c", 1), ikey("d", 1));
        vset.mark_file_number_used(11);
        vset.log_and_apply(&mut edit)?;
        let pinned = vset.current();

        let mut edit = VersionEdit::default();
        edit.delete_file(1, 10);
        vset.log_and_apply(&mut edit)?;

        assert_eq!(vset.current().num_files(1), 1);
        // the old version still references file 10
        assert!(vset.live_files().contains(&10));
        drop(pinned);
        assert!(!vset.live_files().contains(&10));
        Ok(())
    }

    #[test]
    fn level0_compaction_picks_overlapping_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        VersionSet::create_new_db(dir.path(), &BytewiseComparator)?;
        let mut vset = open_set(dir.path(), Options::default());
        vset.recover()?;
        assert!(vset.pick_compaction().is_none());

        let mut edit = VersionEdit::default();
        edit.add_file(0, 10, 100, ikey("a", 1), ikey("c", 1));
        edit.add_file(0, 11, 100, ikey("b", 2), ikey("e", 2));
        edit.add_file(0, 12, 100, ikey("x", 3), ikey("z", 3));
        edit.add_file(0, 13, 100, ikey("d", 4), ikey("f", 4));
        edit.add_file(1, 14, 100, ikey("e", 0), ikey("g", 0));
        edit.add_file(1, 15, 100, ikey("y", 0), ikey("y", 0));
        vset.mark_file_number_used(15);
        vset.log_and_apply(&mut edit)?;
        assert!(vset.needs_compaction());

        let c = vset.pick_compaction().expect("level 0 is full");
        assert_eq!(c.level(), 0);
        let mut numbers: Vec<_> = c.inputs[0].iter().map(|f| f.number).collect();
        numbers.sort();
        assert_eq!(numbers, vec![10, 11, 13]);
        assert_eq!(c.inputs[1].len(), 1);
        assert_eq!(c.inputs[1][0].number, 14);
        assert!(!c.is_trivial_move());
        assert_eq!(NUM_LEVELS, 7);
        Ok(())
    }
}
