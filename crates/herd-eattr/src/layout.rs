//! On-disk attribute record layout.
//!
//! An attribute block is a metadata header followed by variable-length
//! records packed back to back. Each record is a 16-byte header, the name
//! bytes, then either the value itself (stuffed) or an 8-aligned array of
//! data-block pointers (unstuffed). Record lengths are rounded to 8 bytes;
//! the final record in a block carries the LAST flag and its length runs to
//! the end of the block. A record of type `Unused` is a reusable hole.

use herd_error::{HerdError, Result};
use herd_types::{
    BlockNumber, EA_HEADER_SIZE, EA_MAX_DATA_LEN, EA_MAX_NAME_LEN, VolumeGeometry, ea_align,
    read_le_u32, read_le_u64, write_le_u32, write_le_u64,
};

/// Record flag: last record in its block.
pub const EA_FLAG_LAST: u8 = 0x01;

/// Attribute namespaces, as stored in the record's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EaType {
    Unused = 0,
    User = 1,
    System = 2,
    Security = 3,
}

impl EaType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Unused),
            1 => Some(Self::User),
            2 => Some(Self::System),
            3 => Some(Self::Security),
            _ => None,
        }
    }

    /// Listing prefix for this namespace, with the trailing dot.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Unused => "",
            Self::User => "user.",
            Self::System => "system.",
            Self::Security => "security.",
        }
    }
}

/// Parsed record header.
///
/// Layout (16 bytes): rec_len u32, data_len u32, name_len u8, type u8,
/// flags u8, ptr_count u8, pad u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EaHeader {
    pub rec_len: u32,
    pub data_len: u32,
    pub name_len: u8,
    pub ea_type: u8,
    pub flags: u8,
    pub ptr_count: u8,
}

impl EaHeader {
    pub fn parse(block: &[u8], offset: usize) -> Result<Self> {
        let err = |e: herd_types::ParseError| HerdError::Parse(e.to_string());
        let rec_len = read_le_u32(block, offset).map_err(err)?;
        let data_len = read_le_u32(block, offset + 4).map_err(err)?;
        let tail = herd_types::ensure_slice(block, offset + 8, 4).map_err(err)?;
        Ok(Self {
            rec_len,
            data_len,
            name_len: tail[0],
            ea_type: tail[1],
            flags: tail[2],
            ptr_count: tail[3],
        })
    }

    pub fn write(&self, block: &mut [u8], offset: usize) {
        write_le_u32(block, offset, self.rec_len);
        write_le_u32(block, offset + 4, self.data_len);
        block[offset + 8] = self.name_len;
        block[offset + 9] = self.ea_type;
        block[offset + 10] = self.flags;
        block[offset + 11] = self.ptr_count;
        write_le_u32(block, offset + 12, 0);
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.flags & EA_FLAG_LAST != 0
    }

    #[must_use]
    pub fn is_stuffed(&self) -> bool {
        self.ptr_count == 0
    }

    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.ea_type == EaType::Unused as u8
    }

    /// Bytes this record actually occupies: header, name, and inline data or
    /// pointer array, rounded to the record alignment. `rec_len` may be
    /// larger; the difference is slack reusable by a later set.
    #[must_use]
    pub fn size(&self) -> usize {
        let payload = if self.is_stuffed() {
            self.data_len as usize
        } else {
            self.ptr_count as usize * 8
        };
        ea_align(EA_HEADER_SIZE + self.name_len as usize + payload)
    }

    /// Offset of the name bytes relative to the record start.
    #[must_use]
    pub fn name_offset(&self) -> usize {
        EA_HEADER_SIZE
    }

    /// Offset of stuffed data relative to the record start (directly after
    /// the name).
    #[must_use]
    pub fn data_offset(&self) -> usize {
        EA_HEADER_SIZE + self.name_len as usize
    }

    /// Offset of the pointer array relative to the record start (name
    /// rounded up to pointer alignment).
    #[must_use]
    pub fn ptrs_offset(&self) -> usize {
        EA_HEADER_SIZE + ea_align(self.name_len as usize)
    }

    /// Bytes a listing entry for this record takes: prefix, name, NUL.
    #[must_use]
    pub fn listing_len(&self) -> usize {
        let prefix = EaType::from_raw(self.ea_type).map_or(0, |t| t.prefix().len());
        prefix + self.name_len as usize + 1
    }
}

/// Read the pointer array of an unstuffed record.
#[must_use]
pub fn read_pointers(block: &[u8], offset: usize, header: &EaHeader) -> Vec<BlockNumber> {
    let base = offset + header.ptrs_offset();
    (0..header.ptr_count as usize)
        .filter_map(|i| read_le_u64(block, base + i * 8).ok())
        .map(BlockNumber)
        .collect()
}

/// Write one slot of an unstuffed record's pointer array.
pub fn write_pointer(block: &mut [u8], offset: usize, header: &EaHeader, slot: usize, ptr: u64) {
    write_le_u64(block, offset + header.ptrs_offset() + slot * 8, ptr);
}

/// How a set request will be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSize {
    /// Bytes the record occupies in its attribute block.
    pub record: usize,
    /// Whether the value is stored inline.
    pub stuffed: bool,
    /// Data blocks needed when unstuffed.
    pub data_blocks: u32,
}

/// Compute the in-block footprint of a (name, value) request.
#[must_use]
pub fn request_size(geo: &VolumeGeometry, name_len: usize, data_len: usize) -> RequestSize {
    let payload = geo.meta_payload();
    let stuffed = ea_align(EA_HEADER_SIZE + name_len + data_len);
    if stuffed <= payload {
        return RequestSize {
            record: stuffed,
            stuffed: true,
            data_blocks: 0,
        };
    }
    let data_blocks = data_len.div_ceil(payload) as u32;
    RequestSize {
        record: ea_align(EA_HEADER_SIZE + name_len + data_blocks as usize * 8),
        stuffed: false,
        data_blocks,
    }
}

/// Attribute names are 1..=255 bytes.
pub fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > EA_MAX_NAME_LEN {
        return Err(HerdError::InvalidArgument(format!(
            "attribute name length {} out of 1..={EA_MAX_NAME_LEN}",
            name.len()
        )));
    }
    Ok(())
}

/// Validate a request's name and value sizes before any allocation.
pub fn check_request(geo: &VolumeGeometry, name: &[u8], data_len: usize) -> Result<RequestSize> {
    check_name(name)?;
    if data_len > EA_MAX_DATA_LEN {
        return Err(HerdError::OutOfRange(format!(
            "attribute value of {data_len} bytes exceeds {EA_MAX_DATA_LEN}"
        )));
    }
    let size = request_size(geo, name.len(), data_len);
    // Even the unstuffed form must fit one block; only reachable with the
    // smallest block sizes.
    if size.record > geo.meta_payload() {
        return Err(HerdError::OutOfRange(format!(
            "attribute record of {} bytes exceeds block payload {}",
            size.record,
            geo.meta_payload()
        )));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_types::{BlockSize, JournalSlot};

    fn geo() -> VolumeGeometry {
        VolumeGeometry {
            block_size: BlockSize::new(512).unwrap(),
            journal_slot: JournalSlot(0),
            journal_count: 1,
        }
    }

    #[test]
    fn header_round_trip() {
        let mut block = vec![0_u8; 128];
        let header = EaHeader {
            rec_len: 48,
            data_len: 10,
            name_len: 3,
            ea_type: EaType::User as u8,
            flags: EA_FLAG_LAST,
            ptr_count: 0,
        };
        header.write(&mut block, 24);
        assert_eq!(EaHeader::parse(&block, 24).unwrap(), header);
    }

    #[test]
    fn record_size_is_aligned() {
        let stuffed = EaHeader {
            rec_len: 0,
            data_len: 10,
            name_len: 3,
            ea_type: 1,
            flags: 0,
            ptr_count: 0,
        };
        // 16 + 3 + 10 = 29 -> 32
        assert_eq!(stuffed.size(), 32);

        let unstuffed = EaHeader {
            rec_len: 0,
            data_len: 5000,
            name_len: 3,
            ea_type: 1,
            flags: 0,
            ptr_count: 2,
        };
        // 16 + 3 + 16 = 35 -> 40
        assert_eq!(unstuffed.size(), 40);
        // Pointers land after the name rounded to 8: 16 + 8.
        assert_eq!(unstuffed.ptrs_offset(), 24);
    }

    #[test]
    fn request_sizing_picks_stuffed_vs_unstuffed() {
        let geo = geo();
        let payload = geo.meta_payload(); // 488

        let small = request_size(&geo, 3, 10);
        assert!(small.stuffed);
        assert_eq!(small.data_blocks, 0);

        let big = request_size(&geo, 3, payload + 1);
        assert!(!big.stuffed);
        assert_eq!(big.data_blocks, 2);
    }

    #[test]
    fn check_request_limits() {
        let geo = geo();
        assert!(check_request(&geo, b"", 1).is_err());
        assert!(check_request(&geo, &[b'a'; 256], 1).is_err());
        assert!(matches!(
            check_request(&geo, b"bar", EA_MAX_DATA_LEN + 1),
            Err(HerdError::OutOfRange(_))
        ));
        assert!(check_request(&geo, b"foo", 10).is_ok());
        assert!(check_request(&geo, b"foo", EA_MAX_DATA_LEN).is_ok());
    }

    #[test]
    fn listing_length_includes_prefix_and_nul() {
        let header = EaHeader {
            rec_len: 0,
            data_len: 0,
            name_len: 3,
            ea_type: EaType::User as u8,
            flags: 0,
            ptr_count: 0,
        };
        assert_eq!(header.listing_len(), "user.".len() + 3 + 1);
    }

    #[test]
    fn pointer_array_round_trip() {
        let mut block = vec![0_u8; 256];
        let header = EaHeader {
            rec_len: 64,
            data_len: 1000,
            name_len: 3,
            ea_type: 1,
            flags: 0,
            ptr_count: 3,
        };
        header.write(&mut block, 32);
        write_pointer(&mut block, 32, &header, 0, 70);
        write_pointer(&mut block, 32, &header, 1, 71);
        write_pointer(&mut block, 32, &header, 2, 72);

        let ptrs = read_pointers(&block, 32, &header);
        assert_eq!(
            ptrs,
            vec![BlockNumber(70), BlockNumber(71), BlockNumber(72)]
        );
    }
}
