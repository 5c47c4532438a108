//! Read-side attribute operations: find, get, list, raw block copy.

use crate::layout::{EaType, check_name, read_pointers};
use crate::walk::{EaLocation, EaVisit, walk};
use crate::inode_hold;
use herd_block::metatype_check;
use herd_cluster::LockMode;
use herd_error::{HerdError, Result};
use herd_rgrp::{Inode, InodeFlags, Volume};
use herd_types::{BlockNumber, META_HEADER_SIZE, METATYPE_ED, METATYPE_IN};
use std::sync::Arc;

/// Locate the attribute `(ea_type, name)` on `ip`.
///
/// Returns `Ok(None)` both when the name is absent and when the inode has no
/// attribute storage at all.
pub fn find(
    vol: &Arc<Volume>,
    ip: &Inode,
    ea_type: EaType,
    name: &[u8],
) -> Result<Option<EaLocation>> {
    check_name(name)?;
    let _hold = inode_hold(vol, ip, LockMode::Shared)?;
    Ok(find_unlocked(vol, ip, ea_type, name)?.map(|visit| visit.location()))
}

pub(crate) fn find_unlocked(
    vol: &Arc<Volume>,
    ip: &Inode,
    ea_type: EaType,
    name: &[u8],
) -> Result<Option<EaVisit>> {
    for visit in walk(vol, ip)? {
        let visit = visit?;
        if visit.header.is_unused() {
            continue;
        }
        if visit.header.ea_type == ea_type as u8
            && visit.header.name_len as usize == name.len()
            && visit.name() == name
        {
            return Ok(Some(visit));
        }
    }
    Ok(None)
}

/// Copy the value of `(ea_type, name)` into `buf`, returning its length.
///
/// An empty `buf` performs the sizing half of the two-call protocol: the
/// stored length is returned without copying anything.
pub fn get(
    vol: &Arc<Volume>,
    ip: &Inode,
    ea_type: EaType,
    name: &[u8],
    buf: &mut [u8],
) -> Result<usize> {
    check_name(name)?;
    let _hold = inode_hold(vol, ip, LockMode::Shared)?;

    let Some(visit) = find_unlocked(vol, ip, ea_type, name)? else {
        return Err(HerdError::NotFound);
    };

    let data_len = visit.header.data_len as usize;
    if buf.is_empty() {
        return Ok(data_len);
    }
    if data_len > buf.len() {
        return Err(HerdError::OutOfRange(format!(
            "attribute value is {data_len} bytes, buffer holds {}",
            buf.len()
        )));
    }

    if visit.header.is_stuffed() {
        buf[..data_len].copy_from_slice(visit.stuffed_data());
        return Ok(data_len);
    }

    read_unstuffed(vol, &visit, &mut buf[..data_len])?;
    Ok(data_len)
}

/// Concatenate the pointed-to data blocks of an unstuffed record.
fn read_unstuffed(vol: &Volume, visit: &EaVisit, out: &mut [u8]) -> Result<()> {
    let payload = vol.geometry().meta_payload();
    let pointers = read_pointers(&visit.bytes, visit.offset, &visit.header);
    let needed = out.len().div_ceil(payload);

    let mut copied = 0_usize;
    for slot in 0..needed {
        let ptr = pointers.get(slot).copied().unwrap_or(BlockNumber(0));
        if ptr.0 == 0 {
            vol.withdraw().consistency_error("eattr");
            return Err(HerdError::Corrupt {
                block: visit.block.0,
                detail: format!("unstuffed record missing data pointer {slot}"),
            });
        }
        let data = vol.device().read_block(ptr)?;
        metatype_check(data.as_slice(), ptr, METATYPE_ED).map_err(|err| {
            vol.withdraw().consistency_error("eattr");
            err
        })?;
        let take = payload.min(out.len() - copied);
        out[copied..copied + take]
            .copy_from_slice(&data.as_slice()[META_HEADER_SIZE..META_HEADER_SIZE + take]);
        copied += take;
    }
    Ok(())
}

/// Write the prefixed, NUL-terminated names of every attribute into `buf`,
/// returning the byte count.
///
/// An empty `buf` sizes the listing; a non-empty buffer that is too small
/// fails with `OutOfRange` (retry with the size from the first call).
pub fn list(vol: &Arc<Volume>, ip: &Inode, buf: &mut [u8]) -> Result<usize> {
    let _hold = inode_hold(vol, ip, LockMode::Shared)?;

    let mut size = 0_usize;
    for visit in walk(vol, ip)? {
        let visit = visit?;
        if visit.header.is_unused() {
            continue;
        }
        let entry_len = visit.header.listing_len();
        if !buf.is_empty() {
            if size + entry_len > buf.len() {
                return Err(HerdError::OutOfRange(format!(
                    "attribute listing needs more than {} bytes",
                    buf.len()
                )));
            }
            let prefix = EaType::from_raw(visit.header.ea_type)
                .map_or("", EaType::prefix)
                .as_bytes();
            buf[size..size + prefix.len()].copy_from_slice(prefix);
            let name_at = size + prefix.len();
            buf[name_at..name_at + visit.name().len()].copy_from_slice(visit.name());
            buf[size + entry_len - 1] = 0;
        }
        size += entry_len;
    }
    Ok(size)
}

/// Raw copies of the attribute fork's metadata blocks, for diagnostic
/// export: the root block, plus each pointed-to attribute block when the
/// fork is indirect.
pub fn raw_blocks(vol: &Arc<Volume>, ip: &Inode) -> Result<Vec<(BlockNumber, Vec<u8>)>> {
    let _hold = inode_hold(vol, ip, LockMode::Shared)?;

    let Some(root) = ip.eattr else {
        return Ok(Vec::new());
    };
    let root_buf = vol.device().read_block(root)?;
    let mut out = vec![(root, root_buf.as_slice().to_vec())];

    if ip.flags.contains(InodeFlags::EA_INDIRECT) {
        metatype_check(root_buf.as_slice(), root, METATYPE_IN).map_err(|err| {
            vol.withdraw().consistency_error("eattr");
            err
        })?;
        for slot in 0..vol.geometry().indirect_capacity() {
            let ptr = herd_types::read_le_u64(root_buf.as_slice(), META_HEADER_SIZE + slot * 8)
                .map_err(|e| HerdError::Parse(e.to_string()))?;
            if ptr == 0 {
                break;
            }
            let block = BlockNumber(ptr);
            out.push((block, vol.device().read_block(block)?.into_inner()));
        }
    }
    Ok(out)
}

/// Repack the attribute fork into fewer blocks. Deliberately unimplemented;
/// the error tells callers the operation is recognized but unavailable.
pub fn repack(vol: &Arc<Volume>, ip: &Inode) -> Result<()> {
    let _hold = inode_hold(vol, ip, LockMode::Exclusive)?;
    Err(HerdError::Unsupported)
}
