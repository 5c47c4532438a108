#![forbid(unsafe_code)]
//! Extended attributes.
//!
//! Variable-length name/value records packed into fixed-size attribute
//! blocks. Small values live inline in their record (stuffed); larger ones
//! spill into dedicated data blocks referenced by a pointer array in the
//! record (unstuffed). An inode starts with one attribute block and grows
//! through an indirect block of attribute-block pointers.
//!
//! Every mutating operation acquires, in order: the inode's cluster lock
//! (exclusive), a quota hold, the resource index (shared), the chosen
//! resource group lock(s) (exclusive), and only then opens a transaction.
//! Read operations take the inode lock shared. Transactions are sized with
//! conservative upper bounds before they begin; a mutation failing once a
//! transaction is open is a consistency error, not a recoverable one.

pub mod acl;
pub mod dealloc;
mod edit;
pub mod layout;
pub mod ops;
pub mod remove;
pub mod set;
pub mod walk;

pub use acl::acl_chmod;
pub use dealloc::dealloc_all;
pub use layout::{EaHeader, EaType, RequestSize, check_request, request_size};
pub use ops::{find, get, list, raw_blocks, repack};
pub use remove::remove;
pub use set::{SetFlags, set};
pub use walk::{EaLocation, EaVisit, EaWalk, attribute_blocks, walk};

use herd_cluster::{LockHold, LockMode, LockName, Transaction};
use herd_error::{HerdError, Result};
use herd_rgrp::{Inode, Reservation, Volume};
use std::sync::Arc;

/// Transaction sizing: blocks to budget for structures written alongside
/// the attribute data itself.
pub(crate) const RES_DINODE: u32 = 1;
pub(crate) const RES_EATTR: u32 = 1;
pub(crate) const RES_INDIRECT: u32 = 1;
pub(crate) const RES_STATFS: u32 = 1;
pub(crate) const RES_QUOTA: u32 = 2;

/// Take the inode's cluster lock (blocking).
pub(crate) fn inode_hold(vol: &Volume, ip: &Inode, mode: LockMode) -> Result<LockHold> {
    LockHold::acquire(vol.locks(), LockName::inode(ip.num), mode, false)?.ok_or_else(|| {
        HerdError::InvalidArgument("blocking lock acquire returned no grant".to_owned())
    })
}

/// Run an allocating mutation under the full lock ladder: quota lock and
/// check, space reservation (index + group locks), then a transaction
/// sized for `blks` new blocks. The inode's ctime moves inside the same
/// transaction as the mutation.
pub(crate) fn alloc_skeleton(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    blks: u32,
    revokes: u32,
    f: impl FnOnce(&Arc<Volume>, &mut Inode, &mut Reservation, &mut dyn Transaction) -> Result<()>,
) -> Result<()> {
    vol.quota().lock(ip.num)?;
    let result = skeleton_locked(vol, ip, blks, revokes, f);
    vol.quota().unlock(ip.num);
    result
}

fn skeleton_locked(
    vol: &Arc<Volume>,
    ip: &mut Inode,
    blks: u32,
    revokes: u32,
    f: impl FnOnce(&Arc<Volume>, &mut Inode, &mut Reservation, &mut dyn Transaction) -> Result<()>,
) -> Result<()> {
    vol.quota().check(ip.num, ip.uid, ip.gid)?;

    let mut res = vol.reserve_space(ip, blks)?;
    let rg_len = res.rgd().map_or(0, |rgd| rgd.ri().length);
    let mut txn = vol
        .journal()
        .begin(blks + rg_len + RES_DINODE + RES_STATFS + RES_QUOTA, revokes)?;

    match f(vol, ip, &mut res, &mut *txn) {
        Ok(()) => {
            ip.touch_ctime();
            txn.end()?;
            vol.release_reservation(res)?;
            Ok(())
        }
        Err(err) => {
            txn.end()?;
            vol.release_reservation(res)?;
            Err(err)
        }
    }
}
