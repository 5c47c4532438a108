//! Resource index records.
//!
//! The resource index is a special file listing every resource group on the
//! volume as a fixed-size record, in disk order. It only ever grows (volume
//! grow appends groups); a generation change on its lock tells nodes to
//! re-read it.

use herd_error::{HerdError, Result};
use herd_types::{
    BlockNumber, RINDEX_ENTRY_SIZE, read_le_u32, read_le_u64, write_le_u32, write_le_u64,
};
use parking_lot::Mutex;

/// One resource index record: the identity and extent of a single group.
///
/// On-disk layout (64 bytes): addr u64, length u32, pad u32, data0 u64,
/// data u32, bitbytes u32, reserved to 64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RindexEntry {
    /// Block number of the group header (bitmap blocks follow contiguously).
    pub addr: BlockNumber,
    /// Header + bitmap block count.
    pub length: u32,
    /// First data block owned by this group.
    pub data0: BlockNumber,
    /// Number of data blocks owned by this group.
    pub data: u32,
    /// Total bitmap bytes across all of the group's bitmap segments.
    pub bitbytes: u32,
}

impl RindexEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let err = |e: herd_types::ParseError| HerdError::Parse(e.to_string());
        Ok(Self {
            addr: BlockNumber(read_le_u64(bytes, 0).map_err(err)?),
            length: read_le_u32(bytes, 8).map_err(err)?,
            data0: BlockNumber(read_le_u64(bytes, 16).map_err(err)?),
            data: read_le_u32(bytes, 24).map_err(err)?,
            bitbytes: read_le_u32(bytes, 28).map_err(err)?,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        write_le_u64(bytes, 0, self.addr.0);
        write_le_u32(bytes, 8, self.length);
        write_le_u32(bytes, 12, 0);
        write_le_u64(bytes, 16, self.data0.0);
        write_le_u32(bytes, 24, self.data);
        write_le_u32(bytes, 28, self.bitbytes);
        bytes[32..RINDEX_ENTRY_SIZE].fill(0);
    }

    /// Whether `block` falls inside this group's data extent.
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.data0 <= block && block.0 < self.data0.0 + u64::from(self.data)
    }
}

/// Parse the full contents of the resource index file.
///
/// A length that is not a whole number of records means the index file itself
/// is damaged, which is fatal.
pub fn parse_rindex(bytes: &[u8]) -> Result<Vec<RindexEntry>> {
    if bytes.len() % RINDEX_ENTRY_SIZE != 0 {
        return Err(HerdError::Corrupt {
            block: 0,
            detail: format!(
                "resource index length {} is not a multiple of {RINDEX_ENTRY_SIZE}",
                bytes.len()
            ),
        });
    }
    bytes
        .chunks_exact(RINDEX_ENTRY_SIZE)
        .map(RindexEntry::parse)
        .collect()
}

/// Serialize index records in disk order.
#[must_use]
pub fn encode_rindex(entries: &[RindexEntry]) -> Vec<u8> {
    let mut bytes = vec![0_u8; entries.len() * RINDEX_ENTRY_SIZE];
    for (entry, chunk) in entries.iter().zip(bytes.chunks_exact_mut(RINDEX_ENTRY_SIZE)) {
        entry.write(chunk);
    }
    bytes
}

/// Access to the resource index file's bytes.
///
/// The surrounding system backs this with journaled-data reads of the index
/// inode; tests use [`VecRindexSource`].
pub trait RindexSource: Send + Sync {
    fn read_all(&self) -> Result<Vec<u8>>;
}

/// Resource index held in memory. `append` models volume grow.
#[derive(Debug, Default)]
pub struct VecRindexSource {
    bytes: Mutex<Vec<u8>>,
}

impl VecRindexSource {
    #[must_use]
    pub fn new(entries: &[RindexEntry]) -> Self {
        Self {
            bytes: Mutex::new(encode_rindex(entries)),
        }
    }

    pub fn append(&self, entry: &RindexEntry) {
        let mut record = [0_u8; RINDEX_ENTRY_SIZE];
        entry.write(&mut record);
        self.bytes.lock().extend_from_slice(&record);
    }
}

impl RindexSource for VecRindexSource {
    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: u64, data0: u64, data: u32) -> RindexEntry {
        RindexEntry {
            addr: BlockNumber(addr),
            length: 1,
            data0: BlockNumber(data0),
            data,
            bitbytes: data / 4,
        }
    }

    #[test]
    fn record_round_trip() {
        let original = RindexEntry {
            addr: BlockNumber(17),
            length: 3,
            data0: BlockNumber(20),
            data: 4096,
            bitbytes: 1024,
        };
        let mut bytes = [0_u8; RINDEX_ENTRY_SIZE];
        original.write(&mut bytes);
        assert_eq!(RindexEntry::parse(&bytes).unwrap(), original);
    }

    #[test]
    fn contains_is_half_open() {
        let ri = entry(10, 100, 64);
        assert!(!ri.contains(BlockNumber(99)));
        assert!(ri.contains(BlockNumber(100)));
        assert!(ri.contains(BlockNumber(163)));
        assert!(!ri.contains(BlockNumber(164)));
    }

    #[test]
    fn parse_rejects_ragged_length() {
        let bytes = vec![0_u8; RINDEX_ENTRY_SIZE + 3];
        let err = parse_rindex(&bytes).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn source_append_models_grow() {
        let source = VecRindexSource::new(&[entry(10, 100, 64)]);
        assert_eq!(parse_rindex(&source.read_all().unwrap()).unwrap().len(), 1);

        source.append(&entry(200, 210, 64));
        let entries = parse_rindex(&source.read_all().unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].addr, BlockNumber(200));
    }
}
