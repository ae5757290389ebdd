use std::{
    fs::File,
    io::{BufWriter, Write},
    sync::Arc,
};

use bytes::BufMut;

use crate::{
    comparator::{BytewiseComparator, Comparator},
    db::format::{extract_user_key, InternalKeyComparator},
    error::Result,
    filter::FilterPolicy,
    options::{CompressionType, Options},
};

use super::{
    block_builder::BlockBuilder,
    block_handler::{BlockHandle, Footer},
    filter_block::FilterBlockBuilder,
};

/// Writes a sorted table file.
///
/// ```text
///     | data block | trailer | ... | filter block | trailer | meta-index block | trailer |
///     | index block | trailer | footer |
/// ```
///
/// Keys must be added in increasing internal key order. The filter block is built over
/// user keys.
pub struct TableBuilder {
    comparator: InternalKeyComparator,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    block_size: usize,
    compression: CompressionType,

    file: BufWriter<File>,
    offset: u64,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    entries_count: u64,

    closed: bool,

    filter_block: Option<FilterBlockBuilder>,

    // The index entry of a data block is added when the first key of the next block is
    // known, so the separator can be shortened.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl TableBuilder {
    pub fn new(options: &Options, comparator: InternalKeyComparator, file: File) -> Self {
        let icmp: Arc<dyn Comparator> = Arc::new(comparator.clone());
        let data_block = BlockBuilder::new(options.block_restart_interval, icmp.clone());
        // index entries are searched with a binary search on every key
        let index_block = BlockBuilder::new(1, icmp);

        let filter_policy = options.filter_policy();
        let filter_block = filter_policy.as_ref().map(|policy| {
            let mut builder = FilterBlockBuilder::new(policy.clone());
            builder.start_block(0);
            builder
        });

        Self {
            comparator,
            filter_policy,
            block_size: options.block_size,
            compression: options.compression,

            file: BufWriter::new(file),
            offset: 0,

            data_block,
            index_block,
            last_key: Vec::new(),
            entries_count: 0,

            closed: false,

            filter_block,

            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed);
        if self.entries_count > 0 {
            debug_assert!(self.comparator.compare(key, &self.last_key).is_gt());
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            let sep = self.comparator.find_shortest_separator(&self.last_key, key);
            self.index_block.add(&sep, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }

        if let Some(filter_block) = self.filter_block.as_mut() {
            filter_block.add_key(extract_user_key(key));
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entries_count += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes out the pending data block.
    pub fn flush(&mut self) -> Result<()> {
        assert!(!self.closed);
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let raw = self.data_block.finish().to_vec();
        self.data_block.reset();
        self.pending_handle = self.write_block(&raw, self.compression)?;
        self.pending_index_entry = true;

        if let Some(filter_block) = self.filter_block.as_mut() {
            filter_block.start_block(self.offset);
        }
        Ok(())
    }

    /// Finishes the table and syncs it, returning the file size.
    pub fn finish(&mut self) -> Result<u64> {
        self.flush()?;
        assert!(!self.closed);
        self.closed = true;

        // filter block
        let mut filter_handle = None;
        if let Some(filter_block) = self.filter_block.as_mut() {
            let raw = filter_block.finish().to_vec();
            filter_handle = Some(self.write_block(&raw, CompressionType::None)?);
        }

        // meta-index block, keys are plain strings
        let mut meta_index_block =
            BlockBuilder::new(1, Arc::new(BytewiseComparator) as Arc<dyn Comparator>);
        if let (Some(policy), Some(handle)) = (self.filter_policy.as_ref(), filter_handle) {
            let key = format!("filter.{}", policy.name());
            meta_index_block.add(key.as_bytes(), &handle.encode());
        }
        let raw = meta_index_block.finish().to_vec();
        let meta_index_handle = self.write_block(&raw, self.compression)?;

        // index block
        if self.pending_index_entry {
            let sep = self.comparator.find_short_successor(&self.last_key);
            self.index_block.add(&sep, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }
        let raw = self.index_block.finish().to_vec();
        let index_handle = self.write_block(&raw, self.compression)?;

        // footer
        let footer = Footer::new(meta_index_handle, index_handle).encode();
        self.file.write_all(&footer)?;
        self.offset += footer.len() as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.offset)
    }

    pub fn entries_count(&self) -> u64 {
        self.entries_count
    }

    pub fn file_size(&self) -> u64 {
        self.offset
    }

    fn write_block(&mut self, raw: &[u8], compression: CompressionType) -> Result<BlockHandle> {
        let (content, compression) = compress_block(raw, compression);
        let handle = BlockHandle::new(self.offset, content.len() as u64);

        let mut trailer = Vec::with_capacity(5);
        trailer.put_u8(compression as u8);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&content);
        hasher.update(&trailer);
        trailer.put_u32_le(hasher.finalize());

        self.file.write_all(&content)?;
        self.file.write_all(&trailer)?;
        self.offset += (content.len() + trailer.len()) as u64;
        Ok(handle)
    }
}

/// Compressed output is kept only if it saves at least 12.5%.
fn compress_block(raw: &[u8], compression: CompressionType) -> (Vec<u8>, CompressionType) {
    match compression {
        CompressionType::None => (raw.to_vec(), CompressionType::None),
        CompressionType::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(raw);
            if compressed.len() < raw.len() - raw.len() / 8 {
                (compressed, CompressionType::Lz4)
            } else {
                (raw.to_vec(), CompressionType::None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::options::CompressionType;

    use super::compress_block;

    #[test]
    fn compress_only_when_worth_it() {
        let repetitive = vec![b'x'; 4096];
        let (out, ty) = compress_block(&repetitive, CompressionType::Lz4);
        assert_eq!(ty, CompressionType::Lz4);
        assert!(out.len() < repetitive.len() / 2);

        let tiny = b"abc";
        let (out, ty) = compress_block(tiny, CompressionType::Lz4);
        assert_eq!(ty, CompressionType::None);
        assert_eq!(out, tiny);

        let (_, ty) = compress_block(&repetitive, CompressionType::None);
        assert_eq!(ty, CompressionType::None);
    }
}
