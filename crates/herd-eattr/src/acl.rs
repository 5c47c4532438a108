//! In-place value rewrite for mode propagation.
//!
//! A chmod on an inode carrying a POSIX-ACL-style attribute must rewrite
//! the stored ACL bytes and the inode mode atomically. The record's shape
//! is untouched: same length, same placement; only the value bytes change.

use crate::edit::BlockEdit;
use crate::layout::{EaHeader, read_pointers};
use crate::walk::EaLocation;
use crate::{RES_DINODE, RES_EATTR, inode_hold};
use herd_block::metatype_check;
use herd_cluster::{LockMode, Transaction};
use herd_error::{HerdError, Result};
use herd_rgrp::{Inode, Volume};
use herd_types::{META_HEADER_SIZE, METATYPE_ED, S_IFMT};
use std::sync::Arc;

/// Overwrite the record at `loc` with `data` (same length) and set the
/// inode's mode, in one transaction.
pub fn acl_chmod(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    loc: &EaLocation,
    mode: u32,
    data: &[u8],
) -> Result<()> {
    let _hold = inode_hold(vol, ip, LockMode::Exclusive)?;
    vol.withdraw().check()?;

    if (ip.mode ^ mode) & S_IFMT != 0 {
        vol.withdraw().consistency_error("eattr");
        return Err(HerdError::Corrupt {
            block: loc.block.0,
            detail: "mode propagation would change the file type".to_owned(),
        });
    }

    let mut edit = BlockEdit::new(&**vol.device());
    let header = EaHeader::parse(edit.get_mut(loc.block)?, loc.offset)?;
    if data.len() != header.data_len as usize {
        return Err(HerdError::InvalidArgument(format!(
            "in-place rewrite of {} bytes over a {}-byte value",
            data.len(),
            header.data_len
        )));
    }

    if header.is_stuffed() {
        let mut txn = vol.journal().begin(RES_DINODE + RES_EATTR, 0)?;
        txn.mark_dirty(loc.block)?;
        {
            let bytes = edit.get_mut(loc.block)?;
            let data_at = loc.offset + header.data_offset();
            bytes[data_at..data_at + data.len()].copy_from_slice(data);
        }
        edit.flush()?;
        ip.mode = mode;
        ip.touch_ctime();
        return txn.end();
    }

    let payload = vol.geometry().meta_payload();
    let pointers = {
        let bytes = edit.get_mut(loc.block)?;
        read_pointers(bytes, loc.offset, &header)
    };
    let chunks: Vec<&[u8]> = data.chunks(payload).collect();

    let mut txn = vol
        .journal()
        .begin(chunks.len() as u32 + RES_DINODE, 0)?;
    for (slot, chunk) in chunks.iter().enumerate() {
        let Some(ptr) = pointers.get(slot).copied().filter(|p| p.0 != 0) else {
            vol.withdraw().consistency_error("eattr");
            return Err(HerdError::Corrupt {
                block: loc.block.0,
                detail: format!("unstuffed record missing data pointer {slot}"),
            });
        };
        let mut dbytes = vol.device().read_block(ptr)?.into_inner();
        metatype_check(&dbytes, ptr, METATYPE_ED).map_err(|err| {
            vol.withdraw().consistency_error("eattr");
            err
        })?;
        txn.mark_dirty(ptr)?;
        dbytes[META_HEADER_SIZE..META_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        vol.device().write_block(ptr, &dbytes)?;
    }

    ip.mode = mode;
    ip.touch_ctime();
    txn.end()
}
