use std::{fs::File, io, sync::Arc};

use bytes::{Buf, Bytes};

use crate::{
    comparator::{BytewiseComparator, Comparator},
    db::format::{extract_user_key, InternalKeyComparator},
    error::{Error, Result},
    iterator::{BlockSource, BoxedIterator, DBIterator, TwoLevelIterator},
    options::{CompressionType, Options, ReadOptions},
};

use super::{
    block::{Block, BlockIter},
    block_handler::{BlockHandle, Footer, BLOCK_TRAILER_SIZE, FOOTER_SIZE},
    filter_block::FilterBlockReader,
};

/// Uncompressed blocks keyed by `(table cache id, block offset)`.
pub(crate) type BlockCache = quick_cache::sync::Cache<(u64, u64), Block>;

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads the block at `handle` and its trailer, returning the uncompressed contents.
fn read_block(file: &File, handle: &BlockHandle, verify_checksums: bool) -> Result<Bytes> {
    let size = handle.size() as usize;
    let mut buf = vec![0; size + BLOCK_TRAILER_SIZE];
    read_exact_at(file, &mut buf, handle.offset()).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Corruption("truncated block read".into()),
        _ => e.into(),
    })?;

    if verify_checksums {
        let expected = (&buf[size + 1..]).get_u32_le();
        let actual = crc32fast::hash(&buf[..size + 1]);
        if expected != actual {
            return Err(Error::Corruption(format!(
                "block checksum mismatch at offset {}",
                handle.offset()
            )));
        }
    }

    match CompressionType::try_from(buf[size]) {
        Ok(CompressionType::None) => {
            buf.truncate(size);
            Ok(Bytes::from(buf))
        }
        Ok(CompressionType::Lz4) => {
            let data = lz4_flex::decompress_size_prepended(&buf[..size])
                .map_err(|e| Error::Corruption(format!("lz4 block: {e}")))?;
            Ok(Bytes::from(data))
        }
        Err(ty) => Err(Error::Corruption(format!("bad block compression type: {ty}"))),
    }
}

/// An open, immutable table file.
pub struct Table {
    file: File,
    cache_id: u64,
    comparator: Arc<dyn Comparator>,
    paranoid_checks: bool,

    index_block: Block,
    meta_index_handle: BlockHandle,
    filter: Option<FilterBlockReader>,
    block_cache: Option<Arc<BlockCache>>,
}

impl Table {
    pub fn open(
        options: &Options,
        comparator: InternalKeyComparator,
        file: File,
        file_size: u64,
        cache_id: u64,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption("file is too short to be a table".into()));
        }

        let mut footer = vec![0; FOOTER_SIZE];
        read_exact_at(&file, &mut footer, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode_from(&footer)?;

        let paranoid_checks = options.paranoid_checks;
        let index_block = Block::new(read_block(&file, &footer.index_handle, paranoid_checks)?)?;

        let mut table = Self {
            file,
            cache_id,
            comparator: Arc::new(comparator),
            paranoid_checks,
            index_block,
            meta_index_handle: footer.meta_index_handle,
            filter: None,
            block_cache,
        };

        // a broken filter only costs lookups, the table is still usable
        if let Err(e) = table.read_filter(options) {
            if paranoid_checks {
                return Err(e);
            }
            tracing::warn!("ignore filter of table {}: {}", cache_id, e);
        }
        Ok(table)
    }

    fn read_filter(&mut self, options: &Options) -> Result<()> {
        let Some(policy) = options.filter_policy() else {
            return Ok(());
        };

        let meta = Block::new(read_block(
            &self.file,
            &self.meta_index_handle,
            self.paranoid_checks,
        )?)?;
        let mut iter = meta.iter(Arc::new(BytewiseComparator));
        let key = format!("filter.{}", policy.name());
        iter.seek(key.as_bytes());
        if !iter.is_valid() || iter.key() != key.as_bytes() {
            return iter.status();
        }

        let (handle, _) = BlockHandle::decode_from(iter.value())?;
        let data = read_block(&self.file, &handle, self.paranoid_checks)?;
        self.filter = Some(FilterBlockReader::new(policy, data));
        Ok(())
    }

    fn block_reader(
        &self,
        index_value: &[u8],
        verify_checksums: bool,
        fill_cache: bool,
    ) -> Result<BlockIter> {
        let (handle, _) = BlockHandle::decode_from(index_value)?;
        let verify = verify_checksums || self.paranoid_checks;

        let block = match &self.block_cache {
            Some(cache) => {
                let key = (self.cache_id, handle.offset());
                match cache.get(&key) {
                    Some(block) => block,
                    None => {
                        let block = Block::new(read_block(&self.file, &handle, verify)?)?;
                        if fill_cache {
                            cache.insert(key, block.clone());
                        }
                        block
                    }
                }
            }
            None => Block::new(read_block(&self.file, &handle, verify)?)?,
        };
        Ok(block.iter(self.comparator.clone()))
    }

    /// Finds the first entry at or after `internal_key`.
    ///
    /// The caller checks whether the returned key has the wanted user key. `None` is also
    /// returned when the filter rules the key out.
    pub fn internal_get(
        &self,
        read_options: &ReadOptions,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let mut index_iter = self.index_block.iter(self.comparator.clone());
        index_iter.seek(internal_key);
        if !index_iter.is_valid() {
            index_iter.status()?;
            return Ok(None);
        }

        if let Some(filter) = &self.filter {
            let (handle, _) = BlockHandle::decode_from(index_iter.value())?;
            if !filter.key_may_match(handle.offset(), extract_user_key(internal_key)) {
                return Ok(None);
            }
        }

        let mut block_iter = self.block_reader(
            index_iter.value(),
            read_options.verify_checksums,
            read_options.fill_cache,
        )?;
        block_iter.seek(internal_key);
        if !block_iter.is_valid() {
            block_iter.status()?;
            return Ok(None);
        }
        Ok(Some((
            Bytes::copy_from_slice(block_iter.key()),
            Bytes::copy_from_slice(block_iter.value()),
        )))
    }

    pub(crate) fn iter(self: &Arc<Self>, read_options: &ReadOptions) -> TableIterator {
        TwoLevelIterator::new(
            self.index_block.iter(self.comparator.clone()),
            TableBlockSource {
                table: self.clone(),
                verify_checksums: read_options.verify_checksums,
                fill_cache: read_options.fill_cache,
            },
        )
    }

    /// Approximate file offset where the data for `internal_key` starts (or would start).
    pub fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.comparator.clone());
        index_iter.seek(internal_key);
        if index_iter.is_valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset();
            }
        }
        // past the last key, or a bad index entry: close to the end of the file
        self.meta_index_handle.offset()
    }
}

pub(crate) struct TableBlockSource {
    table: Arc<Table>,
    verify_checksums: bool,
    fill_cache: bool,
}

impl BlockSource for TableBlockSource {
    fn open(&self, index_value: &[u8]) -> Result<BoxedIterator> {
        let iter = self
            .table
            .block_reader(index_value, self.verify_checksums, self.fill_cache)?;
        Ok(Box::new(iter))
    }
}

pub(crate) type TableIterator = TwoLevelIterator<BlockIter, TableBlockSource>;

#[cfg(test)]
mod tests {
    use std::{
        fs::{File, OpenOptions},
        io::{Seek, SeekFrom, Write},
        path::Path,
        sync::Arc,
    };

    use bytes::Bytes;

    use crate::{
        comparator::BytewiseComparator,
        db::format::{InternalKey, InternalKeyComparator, LookupKey, ValueType},
        iterator::{
            tests::{collect_backward, collect_forward},
            DBIterator,
        },
        options::{CompressionType, Options, ReadOptions},
        table::table_builder::TableBuilder,
    };

    use super::{BlockCache, Table};

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn entries(n: usize) -> Vec<(InternalKey, Vec<u8>)> {
        (0..n)
            .map(|i| {
                let key = format!("key{i:06}");
                (
                    InternalKey::new(key.as_bytes(), i as u64 + 1, ValueType::Value),
                    format!("value{i}-").repeat(i % 10 + 1).into_bytes(),
                )
            })
            .collect()
    }

    fn build(path: &Path, options: &Options, entries: &[(InternalKey, Vec<u8>)]) -> u64 {
        let file = File::create(path).unwrap();
        let mut builder = TableBuilder::new(options, icmp(), file);
        for (k, v) in entries {
            builder.add(k.as_slice(), v).unwrap();
        }
        let size = builder.finish().unwrap();
        assert_eq!(builder.entries_count(), entries.len() as u64);
        assert_eq!(size, std::fs::metadata(path).unwrap().len());
        size
    }

    fn open(path: &Path, options: &Options, size: u64) -> Arc<Table> {
        let cache = Arc::new(BlockCache::new(64));
        let file = File::open(path).unwrap();
        Arc::new(Table::open(options, icmp(), file, size, 1, Some(cache)).unwrap())
    }

    #[test]
    fn build_and_iterate() -> anyhow::Result<()> {
        for compression in [CompressionType::None, CompressionType::Lz4] {
            let dir = tempfile::tempdir()?;
            let path = dir.path().join("000001.ldb");
            let options = Options::builder()
                .block_size(256)
                .compression(compression)
                .build();

            let entries = entries(500);
            let size = build(&path, &options, &entries);
            let table = open(&path, &options, size);

            let expected: Vec<(Vec<u8>, Vec<u8>)> = entries
                .iter()
                .map(|(k, v)| (k.as_slice().to_vec(), v.clone()))
                .collect();

            let mut iter = table.iter(&ReadOptions::default());
            iter.seek_to_first();
            assert_eq!(collect_forward(&mut iter), expected);

            iter.seek_to_last();
            let mut reversed = expected.clone();
            reversed.reverse();
            assert_eq!(collect_backward(&mut iter), reversed);

            let target = LookupKey::new(b"key000250", 1000);
            iter.seek(target.internal_key());
            assert_eq!(iter.key(), entries[250].0.as_slice());
            iter.prev();
            assert_eq!(iter.key(), entries[249].0.as_slice());
            assert!(iter.status().is_ok());
        }
        Ok(())
    }

    #[test]
    fn point_lookup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000001.ldb");
        let options = Options::builder().block_size(512).build();

        let entries = entries(300);
        let size = build(&path, &options, &entries);
        let table = open(&path, &options, size);
        assert!(table.filter.is_some());

        let read = ReadOptions::default();
        for (k, v) in entries.iter().step_by(7) {
            let lookup = LookupKey::new(k.user_key(), 10_000);
            let (found_key, found_value) =
                table.internal_get(&read, lookup.internal_key())?.unwrap();
            assert_eq!(found_key, k.as_slice());
            assert_eq!(found_value, Bytes::copy_from_slice(v));
        }

        // past the end
        let lookup = LookupKey::new(b"zzz", 10_000);
        assert!(table.internal_get(&read, lookup.internal_key())?.is_none());
        Ok(())
    }

    #[test]
    fn no_filter() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000001.ldb");
        let options = Options::builder().filter_bits_per_key(None).build();

        let entries = entries(10);
        let size = build(&path, &options, &entries);
        let table = open(&path, &options, size);
        assert!(table.filter.is_none());

        let lookup = LookupKey::new(b"key000003", 100);
        let (k, _) = table
            .internal_get(&ReadOptions::default(), lookup.internal_key())?
            .unwrap();
        assert_eq!(k, entries[3].0.as_slice());
        Ok(())
    }

    #[test]
    fn approximate_offsets() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000001.ldb");
        let options = Options::builder()
            .block_size(1024)
            .compression(CompressionType::None)
            .build();

        let entries = entries(1000);
        let size = build(&path, &options, &entries);
        let table = open(&path, &options, size);

        let offset =
            |k: &[u8]| table.approximate_offset_of(LookupKey::new(k, 10_000).internal_key());
        assert_eq!(offset(b""), 0);
        let mid = offset(b"key000500");
        assert!(mid > size / 4 && mid < size * 3 / 4, "mid: {mid}, size: {size}");
        assert!(offset(b"zzz") > size * 9 / 10);
        Ok(())
    }

    #[test]
    fn detect_corruption() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000001.ldb");
        let options = Options::builder()
            .block_size(256)
            .compression(CompressionType::None)
            .build();

        let entries = entries(100);
        let size = build(&path, &options, &entries);

        // flip a byte inside the first data block
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(20))?;
        file.write_all(b"\xff")?;
        drop(file);

        let table = open(&path, &options, size);
        let read = ReadOptions {
            verify_checksums: true,
            ..Default::default()
        };
        let mut iter = table.iter(&read);
        iter.seek_to_first();
        assert!(iter.status().unwrap_err().is_corruption());

        // truncated file
        assert!(Table::open(&options, icmp(), File::open(&path)?, 10, 2, None).is_err());
        Ok(())
    }
}
