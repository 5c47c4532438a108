//! Whole-fork deallocation, for inode destruction.
//!
//! Three phases, mirroring the fork's structure from the leaves up: every
//! unstuffed record's data blocks, then the attribute blocks listed by the
//! indirect table, then the root block itself. Contiguous block runs are
//! freed together, under the locks of every group involved.

use crate::edit::BlockEdit;
use crate::remove::remove_unstuffed_held;
use crate::walk::{EaLocation, walk};
use crate::{RES_DINODE, RES_INDIRECT, RES_QUOTA, RES_STATFS, inode_hold};
use herd_block::metatype_check;
use herd_cluster::{LockMode, Transaction};
use herd_error::{HerdError, Result};
use herd_rgrp::{Inode, InodeFlags, RgrpList, Volume};
use herd_types::{BlockNumber, META_HEADER_SIZE, METATYPE_IN, read_le_u64, write_le_u64};
use std::sync::Arc;

/// Release every block of `ip`'s attribute fork and clear its attribute
/// fields. Called when the inode itself is being destroyed.
pub fn dealloc_all(vol: &Arc<Volume>, ip: &mut Inode) -> Result<()> {
    let _hold = inode_hold(vol, ip, LockMode::Exclusive)?;
    vol.withdraw().check()?;
    if ip.eattr.is_none() {
        return Ok(());
    }

    vol.quota().hold(ip.num)?;
    let result = dealloc_held(vol, ip);
    vol.quota().unhold(ip.num);
    if result.is_ok() {
        tracing::debug!(target: "herd::eattr", inode = ip.num.0, "attribute fork deallocated");
    }
    result
}

fn dealloc_held(vol: &Arc<Volume>, ip: &mut Inode) -> Result<()> {
    // Phase 1: every record still holding data blocks gives them back.
    let mut unstuffed: Vec<EaLocation> = Vec::new();
    for visit in walk(vol, ip)? {
        let visit = visit?;
        if !visit.header.is_stuffed() && !visit.pointers().is_empty() {
            unstuffed.push(visit.location());
        }
    }
    for loc in unstuffed {
        remove_unstuffed_held(vol, ip, &loc, true)?;
    }

    // Phase 2: the indirect table's attribute blocks.
    if ip.flags.contains(InodeFlags::EA_INDIRECT) {
        dealloc_indirect(vol, ip)?;
    }

    // Phase 3: the root block (primary attribute block, or the indirect
    // table itself).
    dealloc_root(vol, ip)
}

fn dealloc_indirect(vol: &Arc<Volume>, ip: &mut Inode) -> Result<()> {
    let Some(ind) = ip.eattr else {
        return Err(HerdError::InvalidArgument(
            "indirect flag set on inode without attribute root".to_owned(),
        ));
    };
    let _ri_hold = vol.hold_rindex()?;

    let mut edit = BlockEdit::new(&**vol.device());
    let capacity = vol.geometry().indirect_capacity();
    let pointers = {
        let bytes = edit.get_mut(ind)?;
        metatype_check(bytes, ind, METATYPE_IN).map_err(|err| {
            vol.withdraw().consistency_error("eattr");
            err
        })?;
        let mut pointers = Vec::new();
        for slot in 0..capacity {
            let ptr = read_le_u64(bytes, META_HEADER_SIZE + slot * 8)
                .map_err(|e| HerdError::Parse(e.to_string()))?;
            if ptr == 0 {
                break;
            }
            pointers.push(BlockNumber(ptr));
        }
        pointers
    };
    if pointers.is_empty() {
        return Ok(());
    }

    let mut rlist = RgrpList::new();
    for ptr in &pointers {
        rlist.add(vol, *ptr)?;
    }
    let bitmap_blocks = rlist.bitmap_blocks();
    let holds = rlist.acquire(vol)?;

    let mut txn = vol.journal().begin(
        bitmap_blocks + RES_DINODE + RES_INDIRECT + RES_STATFS + RES_QUOTA,
        pointers.len() as u32,
    )?;
    txn.mark_dirty(ind)?;

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
                block: ind.0,
                detail: "freeing attribute blocks beyond the inode's block count".to_owned(),
            });
        }
        ip.blocks -= 1;
    }
    if let Some(start) = run_start {
        vol.free_meta(ip, &mut *txn, start, run_len)?;
    }

    {
        let bytes = edit.get_mut(ind)?;
        for slot in 0..pointers.len() {
            write_le_u64(bytes, META_HEADER_SIZE + slot * 8, 0);
        }
    }
    edit.flush()?;
    ip.flags.remove(InodeFlags::EA_INDIRECT);

    ip.touch_ctime();
    txn.end()?;
    holds.refresh_clones();
    Ok(())
}

fn dealloc_root(vol: &Arc<Volume>, ip: &mut Inode) -> Result<()> {
    let Some(root) = ip.eattr else {
        return Ok(());
    };
    let _ri_hold = vol.hold_rindex()?;

    let mut rlist = RgrpList::new();
    rlist.add(vol, root)?;
    let bitmap_blocks = rlist.bitmap_blocks();
    let holds = rlist.acquire(vol)?;

    let mut txn = vol
        .journal()
        .begin(bitmap_blocks + RES_DINODE + RES_STATFS + RES_QUOTA, 1)?;
    vol.free_meta(ip, &mut *txn, root, 1)?;

    if ip.blocks == 0 {
        vol.withdraw().consistency_error("eattr");
        return Err(HerdError::Corrupt {
            block: root.0,
            detail: "freeing the attribute root beyond the inode's block count".to_owned(),
        });
    }
    ip.blocks -= 1;
    ip.eattr = None;
    ip.flags.remove(InodeFlags::EA_INDIRECT);

    ip.touch_ctime();
    txn.end()?;
    holds.refresh_clones();
    Ok(())
}
