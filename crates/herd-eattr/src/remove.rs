//! Attribute removal.
//!
//! Removing a stuffed record is pure in-block surgery: the record is
//! coalesced into its predecessor (which inherits the LAST flag) or, when
//! it leads its block, becomes an unused hole. An unstuffed record first
//! gives its data blocks back to the allocator — batched into contiguous
//! runs, under the locks of every group involved — and then gets the same
//! treatment.

use crate::edit::BlockEdit;
use crate::layout::{EaHeader, EaType, check_name, read_pointers};
use crate::set::{coalesce_into_prev, mark_unused};
use crate::walk::{EaLocation, fixup_prev};
use crate::{RES_DINODE, RES_EATTR, RES_QUOTA, RES_STATFS, inode_hold};
use herd_cluster::{LockMode, Transaction};
use herd_error::{HerdError, Result};
use herd_rgrp::{Inode, InodeFlags, RgrpList, Volume};
use herd_types::BlockNumber;
use std::sync::Arc;

/// Remove the attribute `(ea_type, name)` from `ip`.
pub fn remove(vol: &Arc<Volume>, ip: &mut Inode, ea_type: EaType, name: &[u8]) -> Result<()> {
    check_name(name)?;
    let _hold = inode_hold(vol, ip, LockMode::Exclusive)?;
    vol.withdraw().check()?;
    if ip.flags.contains(InodeFlags::IMMUTABLE) || ip.flags.contains(InodeFlags::APPEND_ONLY) {
        return Err(HerdError::PermissionDenied);
    }

    let Some(visit) = crate::ops::find_unlocked(vol, ip, ea_type, name)? else {
        return Err(HerdError::NotFound);
    };

    let stuffed = visit.header.is_stuffed();
    if stuffed {
        remove_stuffed(vol, ip, visit.location())?;
    } else {
        remove_unstuffed(vol, ip, &visit.location(), true)?;
    }
    tracing::debug!(
        target: "herd::eattr",
        inode = ip.num.0,
        name_len = name.len(),
        stuffed,
        "attribute removed"
    );
    Ok(())
}

/// In-block removal of a stuffed record.
fn remove_stuffed(vol: &Arc<Volume>, ip: &mut Inode, loc: EaLocation) -> Result<()> {
    let mut txn = vol.journal().begin(RES_DINODE + RES_EATTR, 0)?;
    let mut edit = BlockEdit::new(&**vol.device());

    txn.mark_dirty(loc.block)?;
    let bytes = edit.get_mut(loc.block)?;
    match loc.prev {
        Some(prev) => coalesce_into_prev(bytes, prev, loc.offset)?,
        None => mark_unused(bytes, loc.offset, false)?,
    }
    edit.flush()?;

    ip.touch_ctime();
    txn.end()
}

/// Free the data blocks of an unstuffed record and retire the record.
///
/// With `coalesce`, the record is merged into its neighbor or becomes a
/// hole; without it (the slot-reuse path) the record keeps its place and
/// only sheds its pointers. Runs its own quota hold, index hold, group
/// locks, and transaction, in that order.
pub(crate) fn remove_unstuffed(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    loc: &EaLocation,
    coalesce: bool,
) -> Result<()> {
    vol.quota().hold(ip.num)?;
    let result = remove_unstuffed_held(vol, ip, loc, coalesce);
    vol.quota().unhold(ip.num);
    result
}

pub(crate) fn remove_unstuffed_held(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    loc: &EaLocation,
    coalesce: bool,
) -> Result<()> {
    let _ri_hold = vol.hold_rindex()?;

    let mut edit = BlockEdit::new(&**vol.device());
    let (header, pointers) = {
        let bytes = edit.get_mut(loc.block)?;
        let header = EaHeader::parse(bytes, loc.offset)?;
        let pointers: Vec<BlockNumber> = read_pointers(bytes, loc.offset, &header)
            .into_iter()
            .filter(|ptr| ptr.0 != 0)
            .collect();
        (header, pointers)
    };
    if header.is_stuffed() {
        return Ok(());
    }

    let mut rlist = RgrpList::new();
    for ptr in &pointers {
        rlist.add(vol, *ptr)?;
    }
    let bitmap_blocks = rlist.bitmap_blocks();
    let holds = if rlist.is_empty() {
        None
    } else {
        Some(rlist.acquire(vol)?)
    };

    let mut txn = vol.journal().begin(
        bitmap_blocks + RES_DINODE + RES_EATTR + RES_STATFS + RES_QUOTA,
        pointers.len() as u32,
    )?;
    txn.mark_dirty(loc.block)?;

    // Free in contiguous runs and clear the pointer array as we go.
    let mut run_start: Option<BlockNumber> = None;
    let mut run_len = 0_u32;
    for ptr in &pointers {
        match run_start {
            Some(start) if start.0 + u64::from(run_len) == ptr.0 => run_len += 1,
            Some(start) => {
                vol.free_meta(ip, &mut *txn, start, run_len)?;
                run_start = Some(*ptr);
                run_len = 1;
            }
            None => {
                run_start = Some(*ptr);
                run_len = 1;
            }
        }
        if ip.blocks == 0 {
            vol.withdraw().consistency_error("eattr");
            return Err(HerdError::Corrupt {
                block: loc.block.0,
                detail: "freeing attribute data beyond the inode's block count".to_owned(),
            });
        }
        ip.blocks -= 1;
    }
    if let Some(start) = run_start {
        vol.free_meta(ip, &mut *txn, start, run_len)?;
    }

    {
        let bytes = edit.get_mut(loc.block)?;
        for slot in 0..header.ptr_count as usize {
            crate::layout::write_pointer(bytes, loc.offset, &header, slot, 0);
        }

        let mut loc = *loc;
        if coalesce {
            fixup_prev(bytes, &mut loc)?;
        }
        match loc.prev {
            Some(prev) if coalesce => coalesce_into_prev(bytes, prev, loc.offset)?,
            _ => mark_unused(bytes, loc.offset, true)?,
        }
    }
    edit.flush()?;

    ip.touch_ctime();
    txn.end()?;

    if let Some(holds) = holds {
        holds.refresh_clones();
    }
    Ok(())
}
