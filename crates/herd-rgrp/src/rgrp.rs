//! Resource group descriptors.
//!
//! A group is `length` contiguous metadata blocks: a header block whose tail
//! carries the first bitmap bytes, then plain bitmap continuation blocks.
//! Together the bitmap covers exactly `data` cells for the group's data
//! extent `[data0, data0 + data)`.
//!
//! The descriptor caches the group's blocks while anyone holds a checkout
//! guard. During a transaction each mutated bitmap segment grows a clone
//! shadow holding the last committed state, so free-space queries made by
//! other reservations on this node stay accurate while the live buffer
//! reflects in-flight changes.

use crate::bitmap;
use crate::rindex::RindexEntry;
use herd_block::{BlockDevice, init_metadata_block, metatype_check};
use herd_cluster::{LockManager, LockName, Transaction, WithdrawState};
use herd_error::{HerdError, Result};
use herd_types::{
    BLKST_DINODE, BLKST_FREE, BLKST_UNLINKED, BLKST_USED, BlockNumber, CELLS_PER_BYTE, FORMAT_RB,
    FORMAT_RG, Generation, META_HEADER_SIZE, METATYPE_RB, METATYPE_RG, RGRP_HEADER_SIZE,
    read_le_u32, write_le_u32,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Which goal-offset cache an allocation reads and updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Data,
    Meta,
}

/// Group header counters, stored after the metadata header in block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgrpHeader {
    pub flags: u32,
    pub free: u32,
    pub dinodes: u32,
}

impl RgrpHeader {
    fn parse(block: &[u8]) -> Result<Self> {
        let err = |e: herd_types::ParseError| HerdError::Parse(e.to_string());
        Ok(Self {
            flags: read_le_u32(block, META_HEADER_SIZE).map_err(err)?,
            free: read_le_u32(block, META_HEADER_SIZE + 4).map_err(err)?,
            dinodes: read_le_u32(block, META_HEADER_SIZE + 8).map_err(err)?,
        })
    }

    fn write(&self, block: &mut [u8]) {
        write_le_u32(block, META_HEADER_SIZE, self.flags);
        write_le_u32(block, META_HEADER_SIZE + 4, self.free);
        write_le_u32(block, META_HEADER_SIZE + 8, self.dinodes);
        block[META_HEADER_SIZE + 12..RGRP_HEADER_SIZE].fill(0);
    }
}

/// Position of one bitmap segment within the group's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentLayout {
    /// Byte offset of the bitmap within its block.
    offset: usize,
    /// Byte offset of this segment within the group's whole bitmap.
    start: u32,
    /// Bitmap bytes in this segment.
    len: u32,
}

impl SegmentLayout {
    /// First group-relative cell past this segment.
    fn cell_end(&self) -> u32 {
        (self.start + self.len) * CELLS_PER_BYTE
    }
}

/// Compute per-block bitmap extents for a group, validating that they cover
/// the group's data extent exactly.
fn compute_layout(ri: &RindexEntry, block_size: usize) -> Result<Vec<SegmentLayout>> {
    let corrupt = |detail: String| HerdError::Corrupt {
        block: ri.addr.0,
        detail,
    };

    if ri.length == 0 {
        return Err(corrupt("resource group with zero length".to_owned()));
    }

    let header_room = block_size - RGRP_HEADER_SIZE;
    let cont_room = block_size - META_HEADER_SIZE;
    let mut layout = Vec::with_capacity(ri.length as usize);
    let mut bytes_left = ri.bitbytes;

    for x in 0..ri.length {
        let (offset, len) = if ri.length == 1 {
            (RGRP_HEADER_SIZE, bytes_left)
        } else if x == 0 {
            (RGRP_HEADER_SIZE, header_room as u32)
        } else if x + 1 == ri.length {
            (META_HEADER_SIZE, bytes_left)
        } else {
            (META_HEADER_SIZE, cont_room as u32)
        };

        let room = if x == 0 { header_room } else { cont_room };
        if len as usize > room {
            return Err(corrupt(format!(
                "bitmap segment {x} of {} bytes exceeds block payload {room}",
                len
            )));
        }

        layout.push(SegmentLayout {
            offset,
            start: ri.bitbytes - bytes_left,
            len,
        });

        bytes_left = bytes_left.checked_sub(len).ok_or_else(|| {
            corrupt(format!(
                "bitmap bytes exhausted at segment {x}: bitbytes={} length={}",
                ri.bitbytes, ri.length
            ))
        })?;
    }

    if bytes_left != 0 {
        return Err(corrupt(format!(
            "{bytes_left} bitmap bytes left over after {} blocks",
            ri.length
        )));
    }

    let last = layout[layout.len() - 1];
    if last.cell_end() != ri.data {
        return Err(corrupt(format!(
            "bitmap covers {} cells but group owns {} data blocks",
            last.cell_end(),
            ri.data
        )));
    }

    Ok(layout)
}

/// One cached group block: live bytes plus the optional pre-transaction
/// clone shadow.
#[derive(Debug)]
struct SegmentBuf {
    live: Vec<u8>,
    clone: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct RgrpCache {
    /// Active checkout count; buffers are populated iff nonzero.
    refs: u32,
    segments: Vec<SegmentBuf>,
    header: RgrpHeader,
    /// Lock generation the header was parsed under; `None` forces a parse.
    header_version: Option<Generation>,
    last_alloc_data: u32,
    last_alloc_meta: u32,
}

/// Descriptor of one resource group.
pub struct ResourceGroup {
    ri: RindexEntry,
    lock_name: LockName,
    layout: Vec<SegmentLayout>,
    dev: Arc<dyn BlockDevice>,
    locks: Arc<dyn LockManager>,
    withdraw: Arc<WithdrawState>,
    cache: Mutex<RgrpCache>,
    /// Committed-state free count; readable without the group's cluster lock.
    free_clone: Mutex<u32>,
}

impl std::fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGroup")
            .field("ri", &self.ri)
            .finish_non_exhaustive()
    }
}

impl ResourceGroup {
    pub fn new(
        ri: RindexEntry,
        dev: Arc<dyn BlockDevice>,
        locks: Arc<dyn LockManager>,
        withdraw: Arc<WithdrawState>,
    ) -> Result<Arc<Self>> {
        let layout = compute_layout(&ri, dev.block_size() as usize)?;
        Ok(Arc::new(Self {
            ri,
            lock_name: LockName::rgrp(ri.addr),
            layout,
            dev,
            locks,
            withdraw,
            cache: Mutex::new(RgrpCache::default()),
            free_clone: Mutex::new(0),
        }))
    }

    #[must_use]
    pub fn ri(&self) -> &RindexEntry {
        &self.ri
    }

    #[must_use]
    pub fn lock_name(&self) -> LockName {
        self.lock_name
    }

    /// Committed free count, readable without the group's cluster lock.
    #[must_use]
    pub fn free_clone(&self) -> u32 {
        *self.free_clone.lock()
    }

    /// Route fatal errors through the withdrawal service.
    fn fail(&self, err: HerdError) -> HerdError {
        if err.is_fatal() {
            self.withdraw.consistency_error("rgrp");
        }
        err
    }

    /// Read in the group's header and bitmap blocks, validating each block's
    /// type tag. Reference-counted: only the first checkout performs I/O.
    /// If the header is stale relative to the lock's generation it is
    /// re-parsed from the header block.
    pub fn checkout(self: &Arc<Self>) -> Result<RgrpGuard> {
        let mut cache = self.cache.lock();
        if cache.refs > 0 {
            cache.refs += 1;
            return Ok(RgrpGuard {
                rgd: Arc::clone(self),
            });
        }

        let mut segments = Vec::with_capacity(self.layout.len());
        for x in 0..self.layout.len() {
            let block = BlockNumber(self.ri.addr.0 + x as u64);
            let buf = self.dev.read_block(block)?;
            let expected = if x == 0 { METATYPE_RG } else { METATYPE_RB };
            metatype_check(buf.as_slice(), block, expected).map_err(|err| self.fail(err))?;
            segments.push(SegmentBuf {
                live: buf.into_inner(),
                clone: None,
            });
        }

        let generation = self.locks.generation(self.lock_name);
        if cache.header_version != Some(generation) {
            cache.header =
                RgrpHeader::parse(&segments[0].live).map_err(|err| self.fail(err))?;
            cache.header_version = Some(generation);
            tracing::trace!(
                target: "herd::rgrp",
                addr = self.ri.addr.0,
                free = cache.header.free,
                dinodes = cache.header.dinodes,
                generation = generation.0,
                "header refreshed"
            );
        }

        cache.segments = segments;
        cache.refs = 1;
        *self.free_clone.lock() = cache.header.free;
        Ok(RgrpGuard {
            rgd: Arc::clone(self),
        })
    }

    fn checkin(&self) {
        let mut cache = self.cache.lock();
        cache.refs = cache.refs.saturating_sub(1);
        if cache.refs == 0 {
            cache.segments.clear();
        }
    }

    /// Index of the segment holding group-relative `cell`.
    fn segment_of(&self, cell: u32) -> Result<usize> {
        self.layout
            .iter()
            .position(|seg| cell < seg.cell_end())
            .ok_or_else(|| {
                self.fail(HerdError::Corrupt {
                    block: self.ri.addr.0,
                    detail: format!("cell {cell} outside group of {} blocks", self.ri.data),
                })
            })
    }

    /// Write the cached header counters into block 0 and to the device.
    fn write_header(&self, cache: &mut RgrpCache, txn: &mut dyn Transaction) -> Result<()> {
        let header = cache.header;
        header.write(&mut cache.segments[0].live);
        txn.mark_dirty(self.ri.addr)?;
        self.dev.write_block(self.ri.addr, &cache.segments[0].live)?;
        Ok(())
    }

    fn write_segment(&self, cache: &RgrpCache, seg: usize, txn: &mut dyn Transaction) -> Result<()> {
        let block = BlockNumber(self.ri.addr.0 + seg as u64);
        txn.mark_dirty(block)?;
        self.dev.write_block(block, &cache.segments[seg].live)?;
        Ok(())
    }
}

/// Scoped checkout of a resource group's buffers; checks in on drop.
pub struct RgrpGuard {
    rgd: Arc<ResourceGroup>,
}

impl Drop for RgrpGuard {
    fn drop(&mut self) {
        self.rgd.checkin();
    }
}

impl std::fmt::Debug for RgrpGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgrpGuard")
            .field("addr", &self.rgd.ri.addr)
            .finish_non_exhaustive()
    }
}

impl RgrpGuard {
    #[must_use]
    pub fn rgd(&self) -> &Arc<ResourceGroup> {
        &self.rgd
    }

    #[must_use]
    pub fn header(&self) -> RgrpHeader {
        self.rgd.cache.lock().header
    }

    #[must_use]
    pub fn last_alloc(&self, kind: AllocKind) -> u32 {
        let cache = self.rgd.cache.lock();
        match kind {
            AllocKind::Data => cache.last_alloc_data,
            AllocKind::Meta => cache.last_alloc_meta,
        }
    }

    /// Whether the committed free count can satisfy `requested` blocks.
    #[must_use]
    pub fn fits(&self, requested: u32) -> bool {
        self.rgd.free_clone() >= requested
    }

    /// Find a free cell starting at group-relative `goal`, flip it to
    /// `new_state`, and update the header counters.
    ///
    /// Callers only invoke this after a successful group-level space check,
    /// so failing to find a free cell here is a consistency violation, not a
    /// retryable condition.
    pub fn alloc_block(
        &self,
        goal: u32,
        kind: AllocKind,
        new_state: u8,
        txn: &mut dyn Transaction,
    ) -> Result<u32> {
        let rgd = &*self.rgd;
        let mut cache = rgd.cache.lock();

        let cell = Self::search(rgd, &mut cache, goal, BLKST_FREE, new_state, txn)?;

        match kind {
            AllocKind::Data => cache.last_alloc_data = cell,
            AllocKind::Meta => cache.last_alloc_meta = cell,
        }

        if cache.header.free == 0 {
            return Err(rgd.fail(HerdError::Corrupt {
                block: rgd.ri.addr.0,
                detail: "allocation from group with zero free count".to_owned(),
            }));
        }
        cache.header.free -= 1;
        if new_state == BLKST_DINODE {
            cache.header.dinodes += 1;
        }
        rgd.write_header(&mut cache, txn)?;
        drop(cache);

        let mut snap = rgd.free_clone.lock();
        *snap = snap.saturating_sub(1);
        drop(snap);

        tracing::trace!(
            target: "herd::rgrp",
            addr = rgd.ri.addr.0,
            cell,
            new_state,
            "block allocated"
        );
        Ok(cell)
    }

    /// Walk the bitmap segments for a cell in `old_state`, starting at the
    /// segment containing `goal` and wrapping across segments at most once
    /// around. Scans the clone shadow when present so speculative in-flight
    /// frees are not handed out again; writes the new state to both copies.
    fn search(
        rgd: &ResourceGroup,
        cache: &mut RgrpCache,
        goal: u32,
        old_state: u8,
        new_state: u8,
        txn: &mut dyn Transaction,
    ) -> Result<u32> {
        let nsegs = rgd.layout.len();
        let mut seg = rgd.segment_of(goal)?;
        let mut local_goal = goal - rgd.layout[seg].start * CELLS_PER_BYTE;

        // One extra pass so the first-searched segment is revisited from its
        // start after the wrap.
        for _ in 0..=nsegs {
            let lay = rgd.layout[seg];
            let range = lay.offset..lay.offset + lay.len as usize;
            let buf = &cache.segments[seg];
            let scan = buf.clone.as_ref().unwrap_or(&buf.live);
            if let Some(cell) = bitmap::find_state_from(&scan[range.clone()], local_goal, old_state)
            {
                let buf = &mut cache.segments[seg];
                bitmap::set_cell(&mut buf.live[range.clone()], cell, new_state);
                if let Some(clone) = buf.clone.as_mut() {
                    bitmap::set_cell(&mut clone[range], cell, new_state);
                }
                rgd.write_segment(cache, seg, txn)?;
                return Ok(lay.start * CELLS_PER_BYTE + cell);
            }
            seg = (seg + 1) % nsegs;
            local_goal = 0;
        }

        Err(rgd.fail(HerdError::Corrupt {
            block: rgd.ri.addr.0,
            detail: format!("no cell in state {old_state} despite passing the space check"),
        }))
    }

    /// Flip a contiguous run of cells to the free state and credit the
    /// header. The run is guaranteed by caller contract to lie within this
    /// group. Clone shadows are allocated lazily before the first mutation
    /// so free-count snapshots keep reporting the committed state.
    pub fn free_blocks(&self, rel_start: u32, len: u32, txn: &mut dyn Transaction) -> Result<()> {
        self.free_run(rel_start, len, txn)?;

        let rgd = &*self.rgd;
        let mut cache = rgd.cache.lock();
        cache.header.free += len;
        rgd.write_header(&mut cache, txn)
    }

    /// Free one dinode block, moving its count back to free.
    pub fn free_dinode(&self, rel: u32, txn: &mut dyn Transaction) -> Result<()> {
        self.free_run(rel, 1, txn)?;

        let rgd = &*self.rgd;
        let mut cache = rgd.cache.lock();
        if cache.header.dinodes == 0 {
            return Err(rgd.fail(HerdError::Corrupt {
                block: rgd.ri.addr.0,
                detail: "freeing a dinode from a group with zero dinode count".to_owned(),
            }));
        }
        cache.header.dinodes -= 1;
        cache.header.free += 1;
        rgd.write_header(&mut cache, txn)
    }

    fn free_run(&self, rel_start: u32, len: u32, txn: &mut dyn Transaction) -> Result<()> {
        let rgd = &*self.rgd;
        let mut cache = rgd.cache.lock();

        let mut touched = Vec::new();
        for cell in rel_start..rel_start + len {
            let seg = rgd.segment_of(cell)?;
            let lay = rgd.layout[seg];
            let range = lay.offset..lay.offset + lay.len as usize;
            let buf = &mut cache.segments[seg];
            if buf.clone.is_none() {
                buf.clone = Some(buf.live.clone());
            }
            bitmap::set_cell(&mut buf.live[range], cell - lay.start * CELLS_PER_BYTE, BLKST_FREE);
            if !touched.contains(&seg) {
                touched.push(seg);
            }
        }
        for seg in touched {
            rgd.write_segment(&cache, seg, txn)?;
        }
        Ok(())
    }

    /// State of a group-relative cell (diagnostic).
    pub fn block_state(&self, rel: u32) -> Result<u8> {
        let rgd = &*self.rgd;
        let seg = rgd.segment_of(rel)?;
        let lay = rgd.layout[seg];
        let cache = rgd.cache.lock();
        let range = lay.offset..lay.offset + lay.len as usize;
        Ok(bitmap::cell_state(
            &cache.segments[seg].live[range],
            rel - lay.start * CELLS_PER_BYTE,
        ))
    }

    /// Copy live bitmap bytes over every existing clone shadow and reset the
    /// free-count snapshot to the just-committed header value. Called after
    /// a reservation commits.
    pub fn refresh_clones(&self) {
        let rgd = &*self.rgd;
        let mut cache = rgd.cache.lock();
        for (seg, lay) in rgd.layout.iter().enumerate() {
            let range = lay.offset..lay.offset + lay.len as usize;
            let buf = &mut cache.segments[seg];
            if let Some(clone) = buf.clone.as_mut() {
                clone[range.clone()].copy_from_slice(&buf.live[range]);
            }
        }
        *rgd.free_clone.lock() = cache.header.free;
    }

    /// Reconcile bitmap cell counts per state against the header counters.
    /// Diagnostic; a mismatch withdraws the volume.
    pub fn verify(&self) -> Result<()> {
        let rgd = &*self.rgd;
        let cache = rgd.cache.lock();

        let mut counts = [0_u32; 4];
        for (seg, lay) in rgd.layout.iter().enumerate() {
            let range = lay.offset..lay.offset + lay.len as usize;
            let bytes = &cache.segments[seg].live[range];
            for (state, slot) in counts.iter_mut().enumerate() {
                *slot += bitmap::count_state(bytes, state as u8);
            }
        }

        let header = cache.header;
        drop(cache);

        let corrupt = |detail: String| {
            rgd.fail(HerdError::Corrupt {
                block: rgd.ri.addr.0,
                detail,
            })
        };

        if counts[BLKST_FREE as usize] != header.free {
            return Err(corrupt(format!(
                "free mismatch: bitmap {} != header {}",
                counts[BLKST_FREE as usize], header.free
            )));
        }
        let expected_used = rgd.ri.data - header.free - header.dinodes;
        if counts[BLKST_USED as usize] != expected_used {
            return Err(corrupt(format!(
                "used mismatch: bitmap {} != {expected_used}",
                counts[BLKST_USED as usize]
            )));
        }
        if counts[BLKST_UNLINKED as usize] != 0 {
            return Err(corrupt(format!(
                "unlinked mismatch: {} != 0",
                counts[BLKST_UNLINKED as usize]
            )));
        }
        if counts[BLKST_DINODE as usize] != header.dinodes {
            return Err(corrupt(format!(
                "dinode mismatch: bitmap {} != header {}",
                counts[BLKST_DINODE as usize], header.dinodes
            )));
        }
        Ok(())
    }
}

/// Initialize a group's header and bitmap blocks on disk: all cells free.
/// Used at volume creation and by tests.
pub fn format_resource_group(dev: &dyn BlockDevice, ri: &RindexEntry) -> Result<()> {
    let block_size = dev.block_size() as usize;
    compute_layout(ri, block_size)?;

    let mut header_block = init_metadata_block(block_size, METATYPE_RG, FORMAT_RG);
    RgrpHeader {
        flags: 0,
        free: ri.data,
        dinodes: 0,
    }
    .write(&mut header_block);
    dev.write_block(ri.addr, &header_block)?;

    for x in 1..ri.length {
        let block = init_metadata_block(block_size, METATYPE_RB, FORMAT_RB);
        dev.write_block(BlockNumber(ri.addr.0 + u64::from(x)), &block)?;
    }
    Ok(())
}
