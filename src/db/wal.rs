use std::{
    fs::File,
    io::{BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// WAL (Write-Ahead-Log) is a log file that records all changes to the database.
///
/// One log file will store some blocks of data, each of block will contains some records.
/// The block format like this:
///
/// Log file: | Block 1 | Block 2 | ... | Block n |
///
/// Block: | Record 1 | Record 2 | ... | Record n | zero padding |
///
/// Record: | payload len: 2 bytes | record type: 1 byte | payload: dyn len | check sum: 4 bytes |
///
/// The check sum covers the length, the type and the payload. A payload that doesn't fit in
/// the rest of a block is split into fragments. A log file corresponds to a memtable, the
/// manifest uses the same framing.
pub(crate) const BLOCK_SIZE: usize = 32 * 1024;

pub(crate) const HEADER_SIZE: usize = 2 + 1 + 4;

const PADDING: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            other => Err(other),
        }
    }
}

#[derive(Debug)]
struct Record<'a> {
    payload: &'a [u8],
    ty: RecordType,
}

impl Record<'_> {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + HEADER_SIZE);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u8(self.ty as u8);
        buf.put(self.payload);
        let crc = crc32fast::hash(buf.as_ref());
        buf.put_u32(crc);
        buf.freeze()
    }
}

#[derive(Debug)]
pub(crate) struct LogWriter {
    file: BufWriter<File>,

    // The offset within the current block.
    block_offset: usize,

    // Bytes written so far.
    offset: u64,
}

impl LogWriter {
    pub(crate) fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        Ok(Self::new(file))
    }

    pub(crate) fn new(file: File) -> Self {
        Self {
            file: BufWriter::new(file),
            block_offset: 0,
            offset: 0,
        }
    }

    /// Appends one logical record, returning the end offset of the log.
    pub(crate) fn add_record(&mut self, payload: &[u8]) -> Result<u64> {
        let mut left = payload;
        let mut begin = true;

        loop {
            self.try_pad_block()?;

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(avail);
            let end = fragment_len == left.len();

            let ty = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };
            self.write_record(Record {
                payload: &left[..fragment_len],
                ty,
            })?;

            left = &left[fragment_len..];
            begin = false;
            if end {
                break;
            }
        }

        self.try_pad_block()?;
        Ok(self.offset)
    }

    fn write_record(&mut self, record: Record<'_>) -> Result<()> {
        let encoded = record.encode();
        self.file.write_all(&encoded)?;
        self.block_offset += encoded.len();
        self.offset += encoded.len() as u64;
        Ok(())
    }

    // No record starts with a header's worth of bytes or less left in the block.
    fn try_pad_block(&mut self) -> Result<()> {
        let remain = BLOCK_SIZE - self.block_offset;
        if remain <= HEADER_SIZE {
            self.file.write_all(&PADDING[..remain])?;
            self.offset += remain as u64;
            self.block_offset = 0;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}

enum Physical {
    Record(RecordType, Bytes),
    Eof,
    Bad(String),
}

/// Reads logical records back from a log file.
///
/// Corruption (a bad check sum, an unknown record type, a truncated record or a broken
/// fragment sequence) ends the read. In paranoid mode it is an error, otherwise the rest
/// of the file is dropped with a warning.
pub(crate) struct LogReader {
    file: File,
    path: PathBuf,
    paranoid: bool,
    file_len: u64,

    block: Bytes,
    pos: usize,
    block_start: u64,
    next_block_start: u64,
    eof: bool,

    stopped: bool,
    dropped_bytes: u64,
}

impl LogReader {
    pub(crate) fn open(path: impl AsRef<Path>, paranoid: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            paranoid,
            file_len,
            block: Bytes::new(),
            pos: 0,
            block_start: 0,
            next_block_start: 0,
            eof: false,
            stopped: false,
            dropped_bytes: 0,
        })
    }

    /// Bytes skipped because of corruption.
    pub(crate) fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub(crate) fn read_record(&mut self) -> Result<Option<Bytes>> {
        if self.stopped {
            return Ok(None);
        }

        let mut scratch = BytesMut::new();
        let mut in_fragment = false;
        let mut record_start = self.offset();

        loop {
            let physical_start = self.offset();
            match self.read_physical()? {
                Physical::Eof => {
                    if in_fragment {
                        return self.report(record_start, "partial record at end of file");
                    }
                    self.stopped = true;
                    return Ok(None);
                }
                Physical::Bad(reason) => {
                    let start = if in_fragment {
                        record_start
                    } else {
                        physical_start
                    };
                    return self.report(start, &reason);
                }
                Physical::Record(ty, payload) => match ty {
                    RecordType::Full => {
                        if in_fragment {
                            return self.report(record_start, "partial record without end");
                        }
                        return Ok(Some(payload));
                    }
                    RecordType::First => {
                        if in_fragment {
                            return self.report(record_start, "partial record without end");
                        }
                        record_start = physical_start;
                        in_fragment = true;
                        scratch.clear();
                        scratch.extend_from_slice(&payload);
                    }
                    RecordType::Middle | RecordType::Last => {
                        if !in_fragment {
                            return self.report(
                                physical_start,
                                &format!("missing start of fragmented record ({ty:?})"),
                            );
                        }
                        scratch.extend_from_slice(&payload);
                        if ty == RecordType::Last {
                            return Ok(Some(scratch.freeze()));
                        }
                    }
                },
            }
        }
    }

    fn offset(&self) -> u64 {
        self.block_start + self.pos as u64
    }

    fn report(&mut self, offset: u64, reason: &str) -> Result<Option<Bytes>> {
        self.stopped = true;
        self.dropped_bytes = self.file_len.saturating_sub(offset);
        if self.paranoid {
            return Err(Error::Corruption(format!(
                "{:?}: {}, {} bytes dropped",
                self.path, reason, self.dropped_bytes
            )));
        }
        tracing::warn!(
            "log {:?} corrupted at offset {}: {}, dropping {} bytes",
            self.path,
            offset,
            reason,
            self.dropped_bytes
        );
        Ok(None)
    }

    fn read_physical(&mut self) -> Result<Physical> {
        loop {
            if self.block.len() - self.pos <= HEADER_SIZE {
                // padding or the end of a short block
                if self.eof {
                    if self.block.len() > self.pos && self.block[self.pos..].iter().any(|&b| b != 0)
                    {
                        return Ok(Physical::Bad("truncated record header".into()));
                    }
                    self.pos = self.block.len();
                    return Ok(Physical::Eof);
                }
                self.read_block()?;
                continue;
            }

            let mut header = &self.block[self.pos..self.pos + 3];
            let len = header.get_u16() as usize;
            let ty = header.get_u8();

            if self.pos + HEADER_SIZE + len > self.block.len() {
                return Ok(Physical::Bad("truncated record".into()));
            }

            let record_end = self.pos + 3 + len;
            let calc_crc = crc32fast::hash(&self.block[self.pos..record_end]);
            let crc = (&self.block[record_end..record_end + 4]).get_u32();
            if crc != calc_crc {
                return Ok(Physical::Bad(format!(
                    "check sum mismatch, expect: {crc}, calc: {calc_crc}"
                )));
            }

            let ty = match RecordType::try_from(ty) {
                Ok(ty) => ty,
                Err(ty) => return Ok(Physical::Bad(format!("unknown record type: {ty}"))),
            };

            let payload = self.block.slice(self.pos + 3..record_end);
            self.pos = record_end + 4;
            return Ok(Physical::Record(ty, payload));
        }
    }

    fn read_block(&mut self) -> Result<()> {
        let mut buf = vec![0; BLOCK_SIZE];
        let mut n = 0;
        while n < BLOCK_SIZE {
            match self.file.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(n);

        self.block_start = self.next_block_start;
        self.next_block_start += n as u64;
        self.block = Bytes::from(buf);
        self.pos = 0;
        if n < BLOCK_SIZE {
            self.eof = true;
        }
        Ok(())
    }
}
