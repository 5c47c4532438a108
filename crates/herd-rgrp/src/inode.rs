//! Minimal in-memory inode.
//!
//! Only the fields the allocator and attribute layers read or write. Parsing
//! and persisting the on-disk dinode block belongs to the inode layer of the
//! surrounding system; mutations made here (block counts, goal hints, ctime,
//! attribute root) are flushed by that layer inside the same transaction.

use herd_types::{BlockNumber, InodeNumber};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-inode flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeFlags(pub u32);

impl InodeFlags {
    pub const IMMUTABLE: Self = Self(0x0001);
    pub const APPEND_ONLY: Self = Self(0x0002);
    /// Attribute root points at an indirect block of attribute-block pointers
    /// rather than a single attribute block.
    pub const EA_INDIRECT: Self = Self(0x0004);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: Self) {
        self.0 &= !flag.0;
    }
}

/// In-memory inode state consumed by this core.
#[derive(Debug, Clone)]
pub struct Inode {
    pub num: InodeNumber,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: InodeFlags,
    /// Blocks charged to this inode (metadata and data).
    pub blocks: u64,
    /// Change time, seconds since the epoch.
    pub ctime: u64,
    /// Root of the attribute fork: an attribute block, or an indirect block
    /// when `EA_INDIRECT` is set. `None` means no attributes were ever stored.
    pub eattr: Option<BlockNumber>,
    /// Locality hint: last allocated data block.
    pub goal_data: Option<BlockNumber>,
    /// Locality hint: last allocated metadata block.
    pub goal_meta: Option<BlockNumber>,
    /// Address of the resource group that last satisfied an allocation for
    /// this inode; seeds the recent-list scan.
    pub last_alloc_group: Option<u64>,
}

impl Inode {
    #[must_use]
    pub fn new(num: InodeNumber, uid: u32, gid: u32) -> Self {
        Self {
            num,
            uid,
            gid,
            mode: 0,
            flags: InodeFlags::default(),
            blocks: 0,
            ctime: 0,
            eattr: None,
            goal_data: None,
            goal_meta: None,
            last_alloc_group: None,
        }
    }

    /// Bump the change time to now.
    pub fn touch_ctime(&mut self) {
        self.ctime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }
}
