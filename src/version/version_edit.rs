use std::collections::BTreeSet;

use bytes::Bytes;

use crate::{
    db::format::{InternalKey, SeqNumber},
    error::{Error, Result},
    utils::varint::{get_length_prefixed_slice, put_length_prefixed_slice, VarInt},
};

use super::NUM_LEVELS;

/// Tags of the fields in an encoded edit. Values are persisted, never reuse one.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Comparator = 1,
    LogNumber = 2,
    NextFileNumber = 3,
    LastSequence = 4,
    CompactPointer = 5,
    DeletedFile = 6,
    NewFile = 7,
    // 8 was used for large value refs
    PrevLogNumber = 9,
}

impl TryFrom<u32> for Tag {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Tag::Comparator,
            2 => Tag::LogNumber,
            3 => Tag::NextFileNumber,
            4 => Tag::LastSequence,
            5 => Tag::CompactPointer,
            6 => Tag::DeletedFile,
            7 => Tag::NewFile,
            9 => Tag::PrevLogNumber,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    pub number: u64,
    /// File size in bytes.
    pub file_size: u64,
    /// Smallest internal key served by the table.
    pub smallest: InternalKey,
    /// Largest internal key served by the table.
    pub largest: InternalKey,
}

/// A delta between two versions, the unit of the manifest log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SeqNumber>,

    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, seq: SeqNumber) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Adds the file to `level`. `smallest` and `largest` are its key bounds.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            FileMetaData {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(name) = &self.comparator {
            (Tag::Comparator as u32).put_varint(&mut buf);
            put_length_prefixed_slice(&mut buf, name.as_bytes());
        }
        let numbers = [
            (Tag::LogNumber, self.log_number),
            (Tag::PrevLogNumber, self.prev_log_number),
            (Tag::NextFileNumber, self.next_file_number),
            (Tag::LastSequence, self.last_sequence),
        ];
        for (tag, value) in numbers {
            if let Some(value) = value {
                (tag as u32).put_varint(&mut buf);
                value.put_varint(&mut buf);
            }
        }

        for (level, key) in &self.compact_pointers {
            (Tag::CompactPointer as u32).put_varint(&mut buf);
            (*level as u32).put_varint(&mut buf);
            put_length_prefixed_slice(&mut buf, key.as_slice());
        }

        for (level, number) in &self.deleted_files {
            (Tag::DeletedFile as u32).put_varint(&mut buf);
            (*level as u32).put_varint(&mut buf);
            number.put_varint(&mut buf);
        }

        for (level, f) in &self.new_files {
            (Tag::NewFile as u32).put_varint(&mut buf);
            (*level as u32).put_varint(&mut buf);
            f.number.put_varint(&mut buf);
            f.file_size.put_varint(&mut buf);
            put_length_prefixed_slice(&mut buf, f.smallest.as_slice());
            put_length_prefixed_slice(&mut buf, f.largest.as_slice());
        }

        buf
    }

    pub fn decode(mut input: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::default();

        while !input.is_empty() {
            let (tag, n) =
                u32::from_varint(input).ok_or_else(|| corruption("invalid tag"))?;
            input = &input[n..];

            match Tag::try_from(tag) {
                Ok(Tag::Comparator) => {
                    let name = get_slice(&mut input, "comparator name")?;
                    let name = String::from_utf8(name.to_vec())
                        .map_err(|_| corruption("comparator name"))?;
                    edit.comparator = Some(name);
                }
                Ok(Tag::LogNumber) => {
                    edit.log_number = Some(get_u64(&mut input, "log number")?);
                }
                Ok(Tag::PrevLogNumber) => {
                    edit.prev_log_number = Some(get_u64(&mut input, "previous log number")?);
                }
                Ok(Tag::NextFileNumber) => {
                    edit.next_file_number = Some(get_u64(&mut input, "next file number")?);
                }
                Ok(Tag::LastSequence) => {
                    edit.last_sequence = Some(get_u64(&mut input, "last sequence number")?);
                }
                Ok(Tag::CompactPointer) => {
                    let level = get_level(&mut input, "compaction pointer")?;
                    let key = get_internal_key(&mut input, "compaction pointer")?;
                    edit.compact_pointers.push((level, key));
                }
                Ok(Tag::DeletedFile) => {
                    let level = get_level(&mut input, "deleted file")?;
                    let number = get_u64(&mut input, "deleted file")?;
                    edit.deleted_files.insert((level, number));
                }
                Ok(Tag::NewFile) => {
                    let level = get_level(&mut input, "new-file entry")?;
                    let number = get_u64(&mut input, "new-file entry")?;
                    let file_size = get_u64(&mut input, "new-file entry")?;
                    let smallest = get_internal_key(&mut input, "new-file entry")?;
                    let largest = get_internal_key(&mut input, "new-file entry")?;
                    edit.add_file(level, number, file_size, smallest, largest);
                }
                Err(tag) => return Err(corruption(&format!("unknown tag {tag}"))),
            }
        }

        Ok(edit)
    }
}

fn corruption(what: &str) -> Error {
    Error::Corruption(format!("VersionEdit: {what}"))
}

fn get_u64(input: &mut &[u8], what: &str) -> Result<u64> {
    let (value, n) = u64::from_varint(input).ok_or_else(|| corruption(what))?;
    *input = &input[n..];
    Ok(value)
}

fn get_level(input: &mut &[u8], what: &str) -> Result<usize> {
    let (level, n) = u32::from_varint(input).ok_or_else(|| corruption(what))?;
    if level as usize >= NUM_LEVELS {
        return Err(corruption(what));
    }
    *input = &input[n..];
    Ok(level as usize)
}

fn get_slice<'a>(input: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    let (slice, n) = get_length_prefixed_slice(input).ok_or_else(|| corruption(what))?;
    *input = &input[n..];
    Ok(slice)
}

fn get_internal_key(input: &mut &[u8], what: &str) -> Result<InternalKey> {
    let key = get_slice(input, what)?;
    let key = InternalKey::decode_from(Bytes::copy_from_slice(key));
    if key.parse().is_none() {
        return Err(corruption(what));
    }
    Ok(key)
}
