pub mod version_edit;
pub(crate) mod version_set;

use std::{fmt::Write as _, sync::Arc};

pub use version_edit::{FileMetaData, VersionEdit};
pub(crate) use version_set::VersionSet;

use crate::{
    comparator::Comparator,
    db::format::{
        parse_internal_key, InternalKey, InternalKeyComparator, LookupKey, ValueType, MAX_SEQ,
        VALUE_TYPE_FOR_SEEK,
    },
    error::{Error, Result},
    iterator::{BlockSource, BoxedIterator, DBIterator, TwoLevelIterator},
    memtable::LookupResult,
    options::{Options, ReadOptions},
    table_cache::TableCache,
};

pub const NUM_LEVELS: usize = 7;

/// Level-0 compaction starts at this many files.
pub(crate) const L0_COMPACTION_TRIGGER: usize = 4;

/// Each write is delayed a little at this many level-0 files.
pub(crate) const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Writes stop at this many level-0 files until compaction catches up.
pub(crate) const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a flushed memtable may be pushed to when it overlaps nothing.
pub(crate) const MAX_MEM_COMPACT_LEVEL: usize = 2;

pub(crate) fn max_bytes_for_level(level: usize) -> f64 {
    // level 0 is scored by file count, treat it like level 1
    let mut result = 10.0 * 1048576.0;
    for _ in 1..level.max(1) {
        result *= 10.0;
    }
    result
}

/// Stop building a compaction output once it overlaps this many grandparent bytes.
pub(crate) fn max_grandparent_overlap_bytes(options: &Options) -> u64 {
    10 * options.max_file_size as u64
}

/// Upper bound for the inputs of a compaction after growing the lower level.
pub(crate) fn expanded_compaction_byte_size_limit(options: &Options) -> u64 {
    25 * options.max_file_size as u64
}

pub(crate) fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Index of the first file whose largest key is at or after `key`, `files.len()` when
/// there is none. `files` must be sorted and disjoint.
pub(crate) fn find_file(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>], key: &[u8]) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.as_slice(), key).is_lt())
}

fn after_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    user_key.is_some_and(|k| ucmp.compare(k, f.largest.user_key()).is_gt())
}

fn before_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    user_key.is_some_and(|k| ucmp.compare(k, f.smallest.user_key()).is_lt())
}

/// Whether any file overlaps the user key range `[smallest, largest]`. `None` bounds are
/// open. `disjoint` files allow a binary search.
pub(crate) fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint: bool,
    files: &[Arc<FileMetaData>],
    smallest: Option<&[u8]>,
    largest: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator().as_ref();
    if !disjoint {
        return files
            .iter()
            .any(|f| !after_file(ucmp, smallest, f) && !before_file(ucmp, largest, f));
    }

    let index = match smallest {
        Some(smallest) => {
            let key = InternalKey::new(smallest, MAX_SEQ, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, key.as_slice())
        }
        None => 0,
    };
    match files.get(index) {
        Some(f) => !before_file(ucmp, largest, f),
        None => false,
    }
}

/// The set of table files of every level at one point in time.
///
/// A version is immutable once installed. Readers and iterators keep the version they
/// started with alive, which in turn keeps its files from being deleted.
pub struct Version {
    options: Arc<Options>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],

    // level that should be compacted next and its score, < 1 means not needed
    compaction_score: f64,
    compaction_level: usize,
}

impl Version {
    pub(crate) fn new(
        options: Arc<Options>,
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
    ) -> Self {
        Self {
            options,
            icmp,
            table_cache,
            files: std::array::from_fn(|_| Vec::new()),
            compaction_score: -1.0,
            compaction_level: 0,
        }
    }

    pub(crate) fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    pub(crate) fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    pub(crate) fn compaction_level(&self) -> usize {
        self.compaction_level
    }

    /// Looks `key` up in the tables, newest data first.
    ///
    /// `Some(LookupResult::Deleted)` means the newest visible entry is a tombstone.
    pub(crate) fn get(
        &self,
        read_options: &ReadOptions,
        key: &LookupKey,
    ) -> Result<Option<LookupResult>> {
        let ikey = key.internal_key();
        let user_key = key.user_key();
        let ucmp = self.icmp.user_comparator();

        for level in 0..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }

            let candidates: Vec<&Arc<FileMetaData>> = if level == 0 {
                let mut overlapping: Vec<_> = files
                    .iter()
                    .filter(|f| {
                        ucmp.compare(user_key, f.smallest.user_key()).is_ge()
                            && ucmp.compare(user_key, f.largest.user_key()).is_le()
                    })
                    .collect();
                overlapping.sort_by(|a, b| b.number.cmp(&a.number));
                overlapping
            } else {
                match files.get(find_file(&self.icmp, files, ikey)) {
                    Some(f) if ucmp.compare(user_key, f.smallest.user_key()).is_ge() => vec![f],
                    _ => vec![],
                }
            };

            for f in candidates {
                let Some((found, value)) =
                    self.table_cache
                        .get(read_options, f.number, f.file_size, ikey)?
                else {
                    continue;
                };
                let parsed = parse_internal_key(&found).ok_or_else(|| {
                    Error::Corruption(format!("bad internal key in table #{}", f.number))
                })?;
                if ucmp.compare(parsed.user_key, user_key).is_eq() {
                    return Ok(Some(match parsed.value_type {
                        ValueType::Value => LookupResult::Found(value),
                        ValueType::Deletion => LookupResult::Deleted,
                    }));
                }
            }
        }

        Ok(None)
    }

    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Files of `level` that overlap `[begin, end]`, compared by user key.
    ///
    /// For level 0 the range grows with each overlapping file, so the result also holds
    /// every level-0 file that overlaps a picked one.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let files = &self.files[level];
        let mut inputs = vec![];
        let mut i = 0;
        while i < files.len() {
            let f = &files[i];
            i += 1;
            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();
            if user_begin
                .as_deref()
                .is_some_and(|b| ucmp.compare(file_limit, b).is_lt())
            {
                continue;
            }
            if user_end
                .as_deref()
                .is_some_and(|e| ucmp.compare(file_start, e).is_gt())
            {
                continue;
            }

            inputs.push(f.clone());
            if level == 0 {
                if user_begin
                    .as_deref()
                    .is_some_and(|b| ucmp.compare(file_start, b).is_lt())
                {
                    user_begin = Some(file_start.to_vec());
                    inputs.clear();
                    i = 0;
                } else if user_end
                    .as_deref()
                    .is_some_and(|e| ucmp.compare(file_limit, e).is_gt())
                {
                    user_end = Some(file_limit.to_vec());
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// Level a new table covering `[smallest, largest]` should be placed at.
    ///
    /// Pushed below level 0 when it overlaps nothing there, but not so deep that the next
    /// compaction would have to rewrite too much of the level below.
    pub fn pick_level_for_memtable_output(&self, smallest: &[u8], largest: &[u8]) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest), Some(largest)) {
            return level;
        }

        let start = InternalKey::new(smallest, MAX_SEQ, VALUE_TYPE_FOR_SEEK);
        let limit = InternalKey::new(largest, 0, ValueType::Deletion);
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest), Some(largest)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps = self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&overlaps) > max_grandparent_overlap_bytes(&self.options) {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Appends iterators that together yield the content of this version: one per level-0
    /// file and one concatenating iterator per deeper level.
    pub(crate) fn add_iterators(&self, read_options: &ReadOptions, iters: &mut Vec<BoxedIterator>) {
        for f in &self.files[0] {
            iters.push(
                self.table_cache
                    .new_iterator(read_options, f.number, f.file_size),
            );
        }

        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(Box::new(new_level_iterator(
                    self.icmp.clone(),
                    self.table_cache.clone(),
                    read_options.clone(),
                    self.files[level].clone(),
                )));
            }
        }
    }

    /// Approximate number of bytes stored before `ikey` over all levels.
    pub(crate) fn approximate_offset_of(&self, ikey: &[u8]) -> u64 {
        let mut result = 0;
        for (level, files) in self.files.iter().enumerate() {
            for f in files {
                if self.icmp.compare(f.largest.as_slice(), ikey).is_le() {
                    // entirely before ikey
                    result += f.file_size;
                } else if self.icmp.compare(f.smallest.as_slice(), ikey).is_gt() {
                    // entirely after ikey, later files of a sorted level are too
                    if level > 0 {
                        break;
                    }
                } else {
                    result += self
                        .table_cache
                        .approximate_offset_of(f.number, f.file_size, ikey);
                }
            }
        }
        result
    }

    /// Computes the best level to compact next.
    pub(crate) fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = -1.0;

        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // Level 0 is scored by file count: every file is searched by each read,
                // and small write buffers would otherwise trigger too many compactions.
                self.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                self.level_bytes(level) as f64 / max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }

        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    pub fn debug_string(&self) -> String {
        let mut s = String::new();
        for (level, files) in self.files.iter().enumerate() {
            let _ = writeln!(s, "--- level {level} ---");
            for f in files {
                let _ = writeln!(
                    s,
                    " {}:{}[{:?} .. {:?}]",
                    f.number, f.file_size, f.smallest, f.largest
                );
            }
        }
        s
    }
}

pub(crate) type LevelFileIterator = TwoLevelIterator<LevelFileNumIterator, LevelFileSource>;

pub(crate) fn new_level_iterator(
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    read_options: ReadOptions,
    files: Vec<Arc<FileMetaData>>,
) -> LevelFileIterator {
    TwoLevelIterator::new(
        LevelFileNumIterator::new(icmp, files),
        LevelFileSource {
            table_cache,
            read_options,
        },
    )
}

const FILE_VALUE_SIZE: usize = 16;

/// Index over the disjoint files of one level.
///
/// The key is the largest internal key of the file, the value its number and size as
/// two fixed 64-bit integers.
pub(crate) struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    // == files.len() when invalid
    index: usize,
    value: [u8; FILE_VALUE_SIZE],
}

impl LevelFileNumIterator {
    fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        Self {
            icmp,
            files,
            index,
            value: [0; FILE_VALUE_SIZE],
        }
    }

    fn fill_value(&mut self) {
        if let Some(f) = self.files.get(self.index) {
            self.value[..8].copy_from_slice(&f.number.to_le_bytes());
            self.value[8..].copy_from_slice(&f.file_size.to_le_bytes());
        }
    }
}

impl DBIterator for LevelFileNumIterator {
    fn is_valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.fill_value();
    }

    fn seek_to_last(&mut self) {
        self.index = self.files.len().checked_sub(1).unwrap_or(self.files.len());
        self.fill_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.fill_value();
    }

    fn next(&mut self) {
        debug_assert!(self.is_valid());
        self.index += 1;
        self.fill_value();
    }

    fn prev(&mut self) {
        debug_assert!(self.is_valid());
        self.index = match self.index {
            0 => self.files.len(),
            i => i - 1,
        };
        self.fill_value();
    }

    fn key(&self) -> &[u8] {
        self.files[self.index].largest.as_slice()
    }

    fn value(&self) -> &[u8] {
        &self.value
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct LevelFileSource {
    table_cache: Arc<TableCache>,
    read_options: ReadOptions,
}

impl BlockSource for LevelFileSource {
    fn open(&self, index_value: &[u8]) -> Result<BoxedIterator> {
        if index_value.len() != FILE_VALUE_SIZE {
            return Err(Error::Corruption(
                "file reader invoked with unexpected value".to_string(),
            ));
        }
        let mut number = [0; 8];
        let mut size = [0; 8];
        number.copy_from_slice(&index_value[..8]);
        size.copy_from_slice(&index_value[8..]);
        Ok(self.table_cache.new_iterator(
            &self.read_options,
            u64::from_le_bytes(number),
            u64::from_le_bytes(size),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        comparator::BytewiseComparator,
        db::format::{InternalKey, InternalKeyComparator, ValueType},
    };

    use super::{find_file, some_file_overlaps_range, FileMetaData};

    struct Files {
        icmp: InternalKeyComparator,
        files: Vec<Arc<FileMetaData>>,
        disjoint: bool,
    }

    impl Files {
        fn new(disjoint: bool) -> Self {
            Self {
                icmp: InternalKeyComparator::new(Arc::new(BytewiseComparator)),
                files: vec![],
                disjoint,
            }
        }

        fn add(&mut self, smallest: &str, largest: &str) {
            self.add_with_seq(smallest, largest, 100, 100);
        }

        fn add_with_seq(&mut self, smallest: &str, largest: &str, smallest_seq: u64, largest_seq: u64) {
            self.files.push(Arc::new(FileMetaData {
                number: self.files.len() as u64 + 1,
                file_size: 0,
                smallest: InternalKey::new(smallest.as_bytes(), smallest_seq, ValueType::Value),
                largest: InternalKey::new(largest.as_bytes(), largest_seq, ValueType::Value),
            }));
        }

        fn find(&self, key: &str) -> usize {
            let target = InternalKey::new(key.as_bytes(), 100, ValueType::Value);
            find_file(&self.icmp, &self.files, target.as_slice())
        }

        fn overlaps(&self, smallest: Option<&str>, largest: Option<&str>) -> bool {
            some_file_overlaps_range(
                &self.icmp,
                self.disjoint,
                &self.files,
                smallest.map(str::as_bytes),
                largest.map(str::as_bytes),
            )
        }
    }

    #[test]
    fn find_file_empty() {
        let t = Files::new(true);
        assert_eq!(t.find("foo"), 0);
        assert!(!t.overlaps(Some("a"), Some("z")));
        assert!(!t.overlaps(None, Some("z")));
        assert!(!t.overlaps(Some("a"), None));
        assert!(!t.overlaps(None, None));
    }

    #[test]
    fn find_file_single() {
        let mut t = Files::new(true);
        t.add("p", "q");
        assert_eq!(t.find("a"), 0);
        assert_eq!(t.find("p"), 0);
        assert_eq!(t.find("p1"), 0);
        assert_eq!(t.find("q"), 0);
        assert_eq!(t.find("q1"), 1);
        assert_eq!(t.find("z"), 1);

        assert!(!t.overlaps(Some("a"), Some("b")));
        assert!(!t.overlaps(Some("z1"), Some("z2")));
        assert!(t.overlaps(Some("a"), Some("p")));
        assert!(t.overlaps(Some("a"), Some("q")));
        assert!(t.overlaps(Some("p"), Some("p1")));
        assert!(t.overlaps(Some("q"), Some("q")));
        assert!(t.overlaps(Some("a"), Some("z")));

        assert!(!t.overlaps(None, Some("j")));
        assert!(!t.overlaps(Some("r"), None));
        assert!(t.overlaps(None, Some("p")));
        assert!(t.overlaps(Some("q"), None));
        assert!(t.overlaps(None, None));
    }

    #[test]
    fn find_file_multiple() {
        let mut t = Files::new(true);
        t.add("150", "200");
        t.add("200", "250");
        t.add("300", "350");
        t.add("400", "450");
        assert_eq!(t.find("100"), 0);
        assert_eq!(t.find("150"), 0);
        assert_eq!(t.find("151"), 0);
        assert_eq!(t.find("199"), 0);
        assert_eq!(t.find("200"), 0);
        assert_eq!(t.find("201"), 1);
        assert_eq!(t.find("249"), 1);
        assert_eq!(t.find("250"), 1);
        assert_eq!(t.find("251"), 2);
        assert_eq!(t.find("350"), 2);
        assert_eq!(t.find("351"), 3);
        assert_eq!(t.find("450"), 3);
        assert_eq!(t.find("451"), 4);

        assert!(!t.overlaps(Some("100"), Some("149")));
        assert!(!t.overlaps(Some("251"), Some("299")));
        assert!(!t.overlaps(Some("451"), Some("500")));
        assert!(t.overlaps(Some("100"), Some("150")));
        assert!(t.overlaps(Some("200"), Some("200")));
        assert!(t.overlaps(Some("190"), Some("210")));
        assert!(t.overlaps(Some("450"), Some("500")));
    }

    #[test]
    fn overlap_sequence_checks() {
        let mut t = Files::new(true);
        t.add_with_seq("200", "200", 5000, 3000);
        assert!(!t.overlaps(Some("199"), Some("199")));
        assert!(!t.overlaps(Some("201"), Some("300")));
        assert!(t.overlaps(Some("200"), Some("200")));
        assert!(t.overlaps(Some("190"), Some("200")));
        assert!(t.overlaps(Some("200"), Some("210")));
    }

    #[test]
    fn overlapping_files() {
        let mut t = Files::new(false);
        t.add("150", "600");
        t.add("400", "500");
        assert!(!t.overlaps(Some("100"), Some("149")));
        assert!(!t.overlaps(Some("601"), Some("700")));
        assert!(t.overlaps(Some("100"), Some("150")));
        assert!(t.overlaps(Some("450"), Some("700")));
        assert!(t.overlaps(Some("600"), Some("700")));
    }

    #[test]
    fn level_sizes() {
        assert_eq!(super::max_bytes_for_level(1), 10.0 * 1048576.0);
        assert_eq!(super::max_bytes_for_level(0), super::max_bytes_for_level(1));
        assert_eq!(super::max_bytes_for_level(3), 1000.0 * 1048576.0);
    }
}
