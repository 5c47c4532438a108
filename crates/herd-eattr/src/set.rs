//! Attribute creation and replacement.
//!
//! A set first tries to land in existing block space: an unused hole of
//! sufficient length, or the slack behind a live record (splitting the
//! oversized slot in two). Only when no block has room does it allocate a
//! fresh attribute block, growing the fork through an indirect pointer
//! table once the inode's single primary block is no longer enough.
//! Replacement writes the new record before retiring the old one, so a
//! crash between the two leaves a duplicate rather than a loss; the old
//! record is coalesced into its neighbor or left as a reusable hole.

use crate::edit::BlockEdit;
use crate::layout::{EA_FLAG_LAST, EaHeader, EaType, RequestSize, check_request, write_pointer};
use crate::remove::remove_unstuffed;
use crate::walk::{EaLocation, fixup_prev, walk};
use crate::{RES_DINODE, RES_EATTR, alloc_skeleton, inode_hold};
use herd_block::{init_metadata_block, metatype_check};
use herd_cluster::{LockMode, Transaction};
use herd_error::{HerdError, Result};
use herd_rgrp::{Inode, InodeFlags, Reservation, Volume};
use herd_types::{
    BlockNumber, FORMAT_EA, FORMAT_ED, FORMAT_IN, META_HEADER_SIZE, METATYPE_EA, METATYPE_ED,
    METATYPE_IN, read_le_u64, write_le_u64,
};
use std::sync::Arc;

/// Exclusivity flags for [`set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetFlags {
    /// Fail with `AlreadyExists` if the attribute is present.
    pub create: bool,
    /// Fail with `NotFound` if the attribute is absent.
    pub replace: bool,
}

struct SetCtx<'a> {
    ea_type: EaType,
    name: &'a [u8],
    data: &'a [u8],
    size: RequestSize,
}

/// Create or replace the attribute `(ea_type, name)` with `data`.
pub fn set(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    ea_type: EaType,
    name: &[u8],
    data: &[u8],
    flags: SetFlags,
) -> Result<()> {
    if ea_type == EaType::Unused {
        return Err(HerdError::InvalidArgument(
            "cannot set an attribute of the unused type".to_owned(),
        ));
    }
    let size = check_request(vol.geometry(), name, data.len())?;

    let _hold = inode_hold(vol, ip, LockMode::Exclusive)?;
    vol.withdraw().check()?;
    if ip.flags.contains(InodeFlags::IMMUTABLE) {
        return Err(HerdError::PermissionDenied);
    }

    let ctx = SetCtx {
        ea_type,
        name,
        data,
        size,
    };

    if ip.eattr.is_none() {
        if flags.replace {
            return Err(HerdError::NotFound);
        }
        return init_fork(vol, ip, &ctx);
    }

    let result = match crate::ops::find_unlocked(vol, ip, ea_type, name)? {
        Some(visit) => {
            if ip.flags.contains(InodeFlags::APPEND_ONLY) {
                return Err(HerdError::PermissionDenied);
            }
            if flags.create {
                return Err(HerdError::AlreadyExists);
            }
            let was_unstuffed = !visit.header.is_stuffed();
            let old = visit.location();
            set_existing(vol, ip, &ctx, Some(&old))?;
            if was_unstuffed {
                // The old record is a hole now; give its data blocks back.
                remove_unstuffed(vol, ip, &old, true)?;
            }
            Ok(())
        }
        None => {
            if flags.replace {
                return Err(HerdError::NotFound);
            }
            set_existing(vol, ip, &ctx, None)
        }
    };
    if result.is_ok() {
        tracing::debug!(
            target: "herd::eattr",
            inode = ip.num.0,
            name_len = name.len(),
            data_len = data.len(),
            stuffed = size.stuffed,
            "attribute set"
        );
    }
    result
}

/// First attribute on this inode: allocate the primary block and write into
/// its initial whole-payload hole.
fn init_fork(vol: &Arc<Volume>, ip: &mut Inode, ctx: &SetCtx<'_>) -> Result<()> {
    let blks = 1 + ctx.size.data_blocks;
    alloc_skeleton(vol, ip, blks, 0, |vol, ip, res, txn| {
        let mut edit = BlockEdit::new(&**vol.device());
        let block = alloc_ea_block(vol, ip, res, txn, &mut edit)?;
        write_request(vol, ip, res, txn, &mut edit, block, META_HEADER_SIZE, ctx)?;
        ip.eattr = Some(block);
        edit.flush()
    })
}

/// Store into existing block space if any record or hole has room,
/// otherwise fall back to a new attribute block.
fn set_existing(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    ctx: &SetCtx<'_>,
    old: Option<&EaLocation>,
) -> Result<()> {
    // (location, needs split, hole still holds data pointers)
    let mut slot: Option<(EaLocation, bool, bool)> = None;
    for visit in walk(vol, ip)? {
        let visit = visit?;
        let header = visit.header;
        if header.is_unused() {
            if header.rec_len as usize >= ctx.size.record {
                slot = Some((visit.location(), false, !header.is_stuffed()));
                break;
            }
        } else if header.rec_len as usize - header.size() >= ctx.size.record {
            slot = Some((visit.location(), true, false));
            break;
        }
    }

    if let Some((loc, _, true)) = slot {
        // Hole left by an interrupted replace still owns data blocks;
        // release them before writing over the slot.
        remove_unstuffed(vol, ip, &loc, false)?;
    }

    match slot {
        Some((loc, split, _)) if ctx.size.stuffed => set_in_slot(vol, ip, ctx, loc, split, old),
        Some((loc, split, _)) => {
            let blks = 2 + ctx.size.data_blocks;
            alloc_skeleton(vol, ip, blks, 0, |vol, ip, res, txn| {
                let mut edit = BlockEdit::new(&**vol.device());
                let offset = prepare_slot(&mut edit, &loc, split, txn)?;
                write_request(vol, ip, res, txn, &mut edit, loc.block, offset, ctx)?;
                if let Some(old) = old {
                    retire_replaced(&mut edit, *old, txn)?;
                }
                edit.flush()
            })
        }
        None => set_new_block(vol, ip, ctx, old),
    }
}

/// Stuffed value into an existing slot: no allocation, minimal transaction.
fn set_in_slot(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    ctx: &SetCtx<'_>,
    loc: EaLocation,
    split: bool,
    old: Option<&EaLocation>,
) -> Result<()> {
    let mut txn = vol.journal().begin(RES_DINODE + 2 * RES_EATTR, 0)?;
    let mut edit = BlockEdit::new(&**vol.device());

    let offset = prepare_slot(&mut edit, &loc, split, &mut *txn)?;
    write_record(edit.get_mut(loc.block)?, offset, ctx)?;
    if let Some(old) = old {
        retire_replaced(&mut edit, *old, &mut *txn)?;
    }
    edit.flush()?;

    ip.touch_ctime();
    txn.end()
}

/// No in-block space anywhere: allocate a new attribute block, growing the
/// indirect table (or converting the fork to indirect) to reference it.
fn set_new_block(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    ctx: &SetCtx<'_>,
    old: Option<&EaLocation>,
) -> Result<()> {
    let mut blks = 2 + ctx.size.data_blocks;
    if !ip.flags.contains(InodeFlags::EA_INDIRECT) {
        blks += 1;
    }

    alloc_skeleton(vol, ip, blks, 0, |vol, ip, res, txn| {
        let geo = *vol.geometry();
        let mut edit = BlockEdit::new(&**vol.device());

        let (ind_block, slot) = if ip.flags.contains(InodeFlags::EA_INDIRECT) {
            let Some(ind) = ip.eattr else {
                return Err(HerdError::InvalidArgument(
                    "indirect flag set on inode without attribute root".to_owned(),
                ));
            };
            let slot = {
                let bytes = edit.get_mut(ind)?;
                metatype_check(bytes, ind, METATYPE_IN).map_err(|err| {
                    vol.withdraw().consistency_error("eattr");
                    err
                })?;
                free_indirect_slot(bytes, geo.indirect_capacity())?
            };
            txn.mark_dirty(ind)?;
            (ind, slot)
        } else {
            let Some(root) = ip.eattr else {
                return Err(HerdError::InvalidArgument(
                    "growing an attribute fork that was never initialized".to_owned(),
                ));
            };
            let ind = vol.alloc_meta(ip, res, txn)?;
            let mut bytes =
                init_metadata_block(geo.block_size.as_usize(), METATYPE_IN, FORMAT_IN);
            write_le_u64(&mut bytes, META_HEADER_SIZE, root.0);
            txn.mark_dirty(ind)?;
            edit.insert(ind, bytes);
            ip.eattr = Some(ind);
            ip.flags.insert(InodeFlags::EA_INDIRECT);
            ip.blocks += 1;
            (ind, 1)
        };

        let ea_block = alloc_ea_block(vol, ip, res, txn, &mut edit)?;
        {
            let bytes = edit.get_mut(ind_block)?;
            write_le_u64(bytes, META_HEADER_SIZE + slot * 8, ea_block.0);
        }
        write_request(vol, ip, res, txn, &mut edit, ea_block, META_HEADER_SIZE, ctx)?;
        if let Some(old) = old {
            retire_replaced(&mut edit, *old, txn)?;
        }
        edit.flush()
    })
}

/// First empty slot of the indirect pointer table; a full table means this
/// fork cannot grow any further.
fn free_indirect_slot(bytes: &[u8], capacity: usize) -> Result<usize> {
    for slot in 0..capacity {
        let ptr = read_le_u64(bytes, META_HEADER_SIZE + slot * 8)
            .map_err(|e| HerdError::Parse(e.to_string()))?;
        if ptr == 0 {
            return Ok(slot);
        }
    }
    Err(HerdError::NoSpace)
}

/// Allocate and stage a fresh attribute block holding one whole-payload
/// unused record.
fn alloc_ea_block(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    res: &mut Reservation,
    txn: &mut dyn Transaction,
    edit: &mut BlockEdit<'_>,
) -> Result<BlockNumber> {
    let block = vol.alloc_meta(ip, res, txn)?;
    let geo = vol.geometry();
    let mut bytes = init_metadata_block(geo.block_size.as_usize(), METATYPE_EA, FORMAT_EA);
    EaHeader {
        rec_len: geo.meta_payload() as u32,
        data_len: 0,
        name_len: 0,
        ea_type: EaType::Unused as u8,
        flags: EA_FLAG_LAST,
        ptr_count: 0,
    }
    .write(&mut bytes, META_HEADER_SIZE);
    txn.mark_dirty(block)?;
    edit.insert(block, bytes);
    ip.blocks += 1;
    Ok(block)
}

/// Mark the slot's block dirty and, when reusing a live record's slack,
/// split the record so the new value gets the tail.
fn prepare_slot(
    edit: &mut BlockEdit<'_>,
    loc: &EaLocation,
    split: bool,
    txn: &mut dyn Transaction,
) -> Result<usize> {
    txn.mark_dirty(loc.block)?;
    let bytes = edit.get_mut(loc.block)?;
    if split {
        split_record(bytes, loc.offset)
    } else {
        Ok(loc.offset)
    }
}

/// Shrink the record at `offset` to its occupied size and carve the rest
/// into a new record, which inherits the LAST flag. Returns the new
/// record's offset.
fn split_record(bytes: &mut [u8], offset: usize) -> Result<usize> {
    let mut header = EaHeader::parse(bytes, offset)?;
    let used = header.size() as u32;
    let rest = header.rec_len - used;
    let last = header.flags & EA_FLAG_LAST;

    header.rec_len = used;
    header.flags &= !EA_FLAG_LAST;
    header.write(bytes, offset);

    let tail = offset + used as usize;
    EaHeader {
        rec_len: rest,
        data_len: 0,
        name_len: 0,
        ea_type: EaType::Unused as u8,
        flags: last,
        ptr_count: 0,
    }
    .write(bytes, tail);
    Ok(tail)
}

/// Write the request's record header, name, and stuffed data into the slot
/// at `offset`, preserving the slot's record length and LAST flag.
fn write_record(bytes: &mut [u8], offset: usize, ctx: &SetCtx<'_>) -> Result<()> {
    let existing = EaHeader::parse(bytes, offset)?;
    let header = EaHeader {
        rec_len: existing.rec_len,
        data_len: ctx.data.len() as u32,
        name_len: ctx.name.len() as u8,
        ea_type: ctx.ea_type as u8,
        flags: existing.flags,
        ptr_count: if ctx.size.stuffed {
            0
        } else {
            ctx.size.data_blocks as u8
        },
    };
    header.write(bytes, offset);

    let name_at = offset + header.name_offset();
    bytes[name_at..name_at + ctx.name.len()].copy_from_slice(ctx.name);

    if ctx.size.stuffed {
        let data_at = offset + header.data_offset();
        bytes[data_at..data_at + ctx.data.len()].copy_from_slice(ctx.data);
    }
    Ok(())
}

/// Write the slot record and, for unstuffed values, allocate one data block
/// per payload chunk and record the pointers.
fn write_request(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    res: &mut Reservation,
    txn: &mut dyn Transaction,
    edit: &mut BlockEdit<'_>,
    block: BlockNumber,
    offset: usize,
    ctx: &SetCtx<'_>,
) -> Result<()> {
    txn.mark_dirty(block)?;
    write_record(edit.get_mut(block)?, offset, ctx)?;

    if ctx.size.stuffed {
        return Ok(());
    }

    let geo = *vol.geometry();
    let payload = geo.meta_payload();
    for (slot, chunk) in ctx.data.chunks(payload).enumerate() {
        let dblk = vol.alloc_meta(ip, res, txn)?;
        let mut dbytes = init_metadata_block(geo.block_size.as_usize(), METATYPE_ED, FORMAT_ED);
        dbytes[META_HEADER_SIZE..META_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        txn.mark_dirty(dblk)?;
        vol.device().write_block(dblk, &dbytes)?;

        let bytes = edit.get_mut(block)?;
        let header = EaHeader::parse(bytes, offset)?;
        write_pointer(bytes, offset, &header, slot, dblk.0);
        ip.blocks += 1;
    }
    Ok(())
}

/// Retire a replaced record inside the same transaction that wrote its
/// successor: coalesce a stuffed record into its neighbor, or leave an
/// unstuffed (or first-in-block) record as a hole. A hole keeps its data
/// pointers; the caller frees them afterwards.
fn retire_replaced(
    edit: &mut BlockEdit<'_>,
    mut old: EaLocation,
    txn: &mut dyn Transaction,
) -> Result<()> {
    txn.mark_dirty(old.block)?;
    let bytes = edit.get_mut(old.block)?;
    let header = EaHeader::parse(bytes, old.offset)?;

    if old.prev.is_none() || !header.is_stuffed() {
        mark_unused(bytes, old.offset, false)?;
        return Ok(());
    }

    fixup_prev(bytes, &mut old)?;
    match old.prev {
        Some(prev) => coalesce_into_prev(bytes, prev, old.offset),
        None => mark_unused(bytes, old.offset, false),
    }
}

/// Extend the record at `prev` over the record at `offset`, inheriting its
/// LAST flag.
pub(crate) fn coalesce_into_prev(bytes: &mut [u8], prev: usize, offset: usize) -> Result<()> {
    let mut prev_header = EaHeader::parse(bytes, prev)?;
    let header = EaHeader::parse(bytes, offset)?;
    prev_header.rec_len += header.rec_len;
    if header.is_last() {
        prev_header.flags |= EA_FLAG_LAST;
    }
    prev_header.write(bytes, prev);
    Ok(())
}

/// Turn the record at `offset` into a reusable hole.
pub(crate) fn mark_unused(bytes: &mut [u8], offset: usize, clear_ptrs: bool) -> Result<()> {
    let mut header = EaHeader::parse(bytes, offset)?;
    header.ea_type = EaType::Unused as u8;
    if clear_ptrs {
        header.ptr_count = 0;
    }
    header.write(bytes, offset);
    Ok(())
}
