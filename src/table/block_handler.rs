use bytes::{Buf, BufMut};

use crate::{
    error::{Error, Result},
    utils::varint::{VarInt, MAX_VARINT_LEN_U64},
};

pub(crate) const MAX_ENCODE_LEN: usize = MAX_VARINT_LEN_U64 * 2;

pub(crate) const MAGIC_NUMBER: u64 = 0xdb47_7524_8b80_fb57;

/// `| meta-index handle | index handle | padding | magic: u64 le |`
pub(crate) const FOOTER_SIZE: usize = MAX_ENCODE_LEN * 2 + 8;

/// `| compression type: u8 | crc32: u32 le |` after each block.
pub(crate) const BLOCK_TRAILER_SIZE: usize = 5;

/// Location of a block inside a table file, the size excludes the trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn encode_to(&self, buf: &mut impl BufMut) {
        self.offset.put_varint(buf);
        self.size.put_varint(buf);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_ENCODE_LEN);
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes a handle from the front of `data`, returning it with the bytes consumed.
    pub fn decode_from(data: &[u8]) -> Result<(Self, usize)> {
        let bad = || Error::Corruption("bad block handle".into());
        let (offset, n) = u64::from_varint(data).ok_or_else(bad)?;
        let (size, m) = u64::from_varint(&data[n..]).ok_or_else(bad)?;
        Ok((Self { offset, size }, n + m))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub(crate) meta_index_handle: BlockHandle,
    pub(crate) index_handle: BlockHandle,
}

impl Footer {
    pub fn new(meta_index_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self {
            meta_index_handle,
            index_handle,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.meta_index_handle.encode_to(&mut buf);
        self.index_handle.encode_to(&mut buf);
        buf.resize(MAX_ENCODE_LEN * 2, 0);
        buf.put_u64_le(MAGIC_NUMBER);
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        buf
    }

    pub fn decode_from(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(Error::Corruption("file is too short to be a table".into()));
        }
        let data = &data[data.len() - FOOTER_SIZE..];
        let magic = (&data[MAX_ENCODE_LEN * 2..]).get_u64_le();
        if magic != MAGIC_NUMBER {
            return Err(Error::Corruption("not a table (bad magic number)".into()));
        }

        let (meta_index_handle, n) = BlockHandle::decode_from(data)?;
        let (index_handle, _) = BlockHandle::decode_from(&data[n..])?;
        Ok(Self {
            meta_index_handle,
            index_handle,
        })
    }
}
