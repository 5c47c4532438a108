#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait, file- and memory-backed devices, and the
//! metadata header codec shared by every herdfs metadata block. Caching and
//! writeback policy belong to the surrounding system; devices here perform
//! synchronous reads and writes only.

use herd_error::{HerdError, Result};
use herd_types::{
    BlockNumber, HERD_MAGIC, META_HEADER_SIZE, ParseError, read_le_u32, write_le_u32,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| HerdError::InvalidArgument("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(HerdError::OutOfRange(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(HerdError::PermissionDenied);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| HerdError::InvalidArgument("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(HerdError::OutOfRange(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Adapter exposing any `ByteDevice` as a `BlockDevice`.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(HerdError::InvalidArgument(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let len = inner.len_bytes();
        if len % u64::from(block_size) != 0 {
            return Err(HerdError::InvalidArgument(format!(
                "device length {len} is not a multiple of block_size {block_size}"
            )));
        }
        let block_count = len / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(HerdError::OutOfRange(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let offset = block.0 * u64::from(self.block_size);
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(HerdError::InvalidArgument(format!(
                "write_block size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if block.0 >= self.block_count {
            return Err(HerdError::OutOfRange(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.inner.write_all_at(block.0 * u64::from(self.block_size), data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Shared in-memory block device.
///
/// Unwritten blocks read back as zeroes. Used by the test suites and as the
/// backing store for single-node operation on images held in memory.
#[derive(Debug, Clone)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Arc<Mutex<HashMap<u64, Vec<u8>>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(HerdError::OutOfRange(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let blocks = self.blocks.lock();
        Ok(blocks.get(&block.0).map_or_else(
            || BlockBuf::new(vec![0_u8; self.block_size as usize]),
            |data| BlockBuf::new(data.clone()),
        ))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(HerdError::InvalidArgument(format!(
                "write_block size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if block.0 >= self.block_count {
            return Err(HerdError::OutOfRange(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Metadata header ─────────────────────────────────────────────────────────

/// Header at the front of every metadata block: magic, type tag, format.
///
/// Layout (24 bytes): magic u32, meta_type u32, pad u64, format u32, pad u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaHeader {
    pub meta_type: u32,
    pub format: u32,
}

impl MetaHeader {
    pub fn parse(data: &[u8]) -> std::result::Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != HERD_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: HERD_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            meta_type: read_le_u32(data, 4)?,
            format: read_le_u32(data, 16)?,
        })
    }

    pub fn write(&self, data: &mut [u8]) {
        write_le_u32(data, 0, HERD_MAGIC);
        write_le_u32(data, 4, self.meta_type);
        data[8..16].fill(0);
        write_le_u32(data, 16, self.format);
        write_le_u32(data, 20, 0);
    }
}

/// Check that `data` carries a valid header of the expected metadata type.
///
/// A mismatch means the block on disk is not what the filesystem believes it
/// is, which is never recoverable per-call.
pub fn metatype_check(data: &[u8], block: BlockNumber, expected: u32) -> Result<()> {
    let header = MetaHeader::parse(data).map_err(|err| HerdError::Corrupt {
        block: block.0,
        detail: err.to_string(),
    })?;
    if header.meta_type != expected {
        return Err(HerdError::Corrupt {
            block: block.0,
            detail: format!(
                "metadata type mismatch: expected {expected}, found {}",
                header.meta_type
            ),
        });
    }
    Ok(())
}

/// Build a zeroed metadata block stamped with the given type and format.
#[must_use]
pub fn init_metadata_block(block_size: usize, meta_type: u32, format: u32) -> Vec<u8> {
    let mut data = vec![0_u8; block_size];
    MetaHeader { meta_type, format }.write(&mut data);
    data
}
