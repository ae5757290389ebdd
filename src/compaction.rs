use std::{fmt, sync::Arc};

use crate::{
    comparator::Comparator,
    db::format::InternalKey,
    options::Options,
    version::{
        max_grandparent_overlap_bytes, total_file_size, FileMetaData, Version, VersionEdit,
        NUM_LEVELS,
    },
};

/// A compaction of `level` files into `level + 1`.
pub(crate) struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    input_version: Arc<Version>,
    edit: VersionEdit,

    /// `inputs[0]` are the files of `level`, `inputs[1]` the files of `level + 1`.
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],

    /// Files of `level + 2` overlapping the key range of the inputs.
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per level cursor for `is_base_level_for_key`. Keys are queried in ascending order,
    // so each cursor only moves forward.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(options: &Options, level: usize, input_version: Arc<Version>) -> Self {
        Self {
            level,
            max_output_file_size: options.max_file_size as u64,
            max_grandparent_overlap: max_grandparent_overlap_bytes(options),
            input_version,
            edit: VersionEdit::default(),
            inputs: [vec![], vec![]],
            grandparents: vec![],
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub(crate) fn level(&self) -> usize {
        self.level
    }

    pub(crate) fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    pub(crate) fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    pub(crate) fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub(crate) fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub(crate) fn input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }

    /// A single input file with nothing to merge against can move to the next level by a
    /// manifest edit. Too much grandparent overlap would make the later compaction of the
    /// moved file expensive, so that case is merged normally.
    pub(crate) fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Adds the deletion of every input file to the edit.
    pub(crate) fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for f in &self.inputs[which] {
                self.edit.delete_file(self.level + which, f.number);
            }
        }
    }

    /// Whether no level below the output level can hold `user_key`, so a tombstone for it
    /// has nothing left to shadow.
    pub(crate) fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let ucmp = self.input_version.icmp().user_comparator().clone();
        for level in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(level);
            while let Some(f) = files.get(self.level_ptrs[level]) {
                if ucmp.compare(user_key, f.largest.user_key()).is_le() {
                    if ucmp.compare(user_key, f.smallest.user_key()).is_ge() {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output should be finished before `internal_key`, because it
    /// already overlaps too much of the grandparent level.
    pub(crate) fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        let icmp = self.input_version.icmp();
        while let Some(f) = self.grandparents.get(self.grandparent_index) {
            if icmp.compare(internal_key, f.largest.as_slice()).is_le() {
                break;
            }
            if self.seen_key {
                self.overlapped_bytes += f.file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    pub(crate) fn into_edit(self) -> VersionEdit {
        self.edit
    }
}

impl fmt::Debug for Compaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let numbers = |files: &[Arc<FileMetaData>]| files.iter().map(|f| f.number).collect::<Vec<_>>();
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field("inputs", &numbers(&self.inputs[0]))
            .field("next_level_inputs", &numbers(&self.inputs[1]))
            .field("grandparents", &self.grandparents.len())
            .finish()
    }
}

/// Smallest and largest key over `files`, which must not be empty.
pub(crate) fn key_range<'a>(
    icmp: &dyn Comparator,
    files: impl IntoIterator<Item = &'a Arc<FileMetaData>>,
) -> (InternalKey, InternalKey) {
    let mut files = files.into_iter();
    let first = files.next();
    debug_assert!(first.is_some());
    let (mut smallest, mut largest) = match first {
        Some(f) => (&f.smallest, &f.largest),
        None => return (InternalKey::default(), InternalKey::default()),
    };
    for f in files {
        if icmp.compare(f.smallest.as_slice(), smallest.as_slice()).is_lt() {
            smallest = &f.smallest;
        }
        if icmp.compare(f.largest.as_slice(), largest.as_slice()).is_gt() {
            largest = &f.largest;
        }
    }
    (smallest.clone(), largest.clone())
}
