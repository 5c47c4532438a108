//! Allocation and free entry points.
//!
//! All of these run under a caller-held resource group lock: allocations via
//! the reservation taken by `reserve_space`, frees via the reservation or a
//! `RgrpList` acquisition. The lock order for any mutating operation is
//! inode lock, quota hold, resource index (shared), group lock (exclusive),
//! then transaction begin; reversing it risks cross-node deadlock.

use crate::inode::Inode;
use crate::reserve::Reservation;
use crate::rgrp::AllocKind;
use crate::volume::Volume;
use herd_cluster::Transaction;
use herd_error::{HerdError, Result};
use herd_types::{BLKST_DINODE, BLKST_USED, BlockNumber};

impl Volume {
    /// Allocate one data block from the reserved group, biased toward the
    /// inode's data goal.
    pub fn alloc_data(
        &self,
        ip: &mut Inode,
        res: &mut Reservation,
        txn: &mut dyn Transaction,
    ) -> Result<BlockNumber> {
        let block = self.alloc_from(ip.goal_data, res, AllocKind::Data, BLKST_USED, txn)?;
        ip.goal_data = Some(block);
        self.note_alloc(ip, res)?;
        self.space().change(0, -1, 0);
        self.quota().change(ip.num, 1, ip.uid, ip.gid);
        Ok(block)
    }

    /// Allocate one metadata block, biased toward the inode's metadata goal.
    /// The block is un-revoked in the journal since it may carry journaled
    /// metadata again before any pending revoke hits disk.
    pub fn alloc_meta(
        &self,
        ip: &mut Inode,
        res: &mut Reservation,
        txn: &mut dyn Transaction,
    ) -> Result<BlockNumber> {
        let block = self.alloc_from(ip.goal_meta, res, AllocKind::Meta, BLKST_USED, txn)?;
        ip.goal_meta = Some(block);
        self.note_alloc(ip, res)?;
        self.space().change(0, -1, 0);
        self.quota().change(ip.num, 1, ip.uid, ip.gid);
        txn.unrevoke(block);
        Ok(block)
    }

    /// Allocate a dinode block. Quota for the new inode is charged by the
    /// inode-creation path, not here.
    pub fn alloc_dinode(
        &self,
        ip: &mut Inode,
        res: &mut Reservation,
        txn: &mut dyn Transaction,
    ) -> Result<BlockNumber> {
        let block = self.alloc_from(None, res, AllocKind::Meta, BLKST_DINODE, txn)?;
        self.note_alloc(ip, res)?;
        self.space().change(0, -1, 1);
        txn.unrevoke(block);
        Ok(block)
    }

    fn alloc_from(
        &self,
        goal_hint: Option<BlockNumber>,
        res: &mut Reservation,
        kind: AllocKind,
        new_state: u8,
        txn: &mut dyn Transaction,
    ) -> Result<BlockNumber> {
        self.withdraw().check()?;

        let guard = res.guard()?;
        let rgd = guard.rgd();
        let ri = *rgd.ri();

        if res.consumed() >= res.requested() {
            self.withdraw().consistency_error("reservation");
            return Err(HerdError::Corrupt {
                block: ri.addr.0,
                detail: format!(
                    "allocation beyond reservation: {} blocks reserved",
                    res.requested()
                ),
            });
        }

        // Group-relative goal: the inode's remembered block if it falls in
        // this group, else the group's own last-allocation cursor.
        let goal = goal_hint
            .filter(|block| ri.contains(*block))
            .map_or_else(|| guard.last_alloc(kind), |block| (block.0 - ri.data0.0) as u32);

        let rel = guard.alloc_block(goal, kind, new_state, txn)?;
        Ok(BlockNumber(ri.data0.0 + u64::from(rel)))
    }

    fn note_alloc(&self, ip: &Inode, res: &mut Reservation) -> Result<()> {
        res.note_consumed();
        tracing::trace!(
            target: "herd::rgrp",
            inode = ip.num.0,
            consumed = res.consumed(),
            requested = res.requested(),
            "block consumed from reservation"
        );
        Ok(())
    }

    /// Free a contiguous run of data blocks. The run lies within one group
    /// by caller contract, and the caller holds that group's lock.
    pub fn free_data(
        &self,
        ip: &Inode,
        txn: &mut dyn Transaction,
        start: BlockNumber,
        len: u32,
    ) -> Result<()> {
        self.free_run(txn, start, len)?;
        self.space().change(0, i64::from(len), 0);
        self.quota().change(ip.num, -i64::from(len), ip.uid, ip.gid);
        Ok(())
    }

    /// Free a contiguous run of metadata blocks. There is no node-local
    /// metadata cache beyond checked-out group buffers, so no cached copies
    /// need wiping here.
    pub fn free_meta(
        &self,
        ip: &Inode,
        txn: &mut dyn Transaction,
        start: BlockNumber,
        len: u32,
    ) -> Result<()> {
        self.free_run(txn, start, len)?;
        self.space().change(0, i64::from(len), 0);
        self.quota().change(ip.num, -i64::from(len), ip.uid, ip.gid);
        Ok(())
    }

    fn free_run(&self, txn: &mut dyn Transaction, start: BlockNumber, len: u32) -> Result<()> {
        self.withdraw().check()?;
        let rgd = self.lookup_rgrpd_or_fail(start)?;
        let guard = rgd.checkout()?;
        let rel = (start.0 - rgd.ri().data0.0) as u32;
        guard.free_blocks(rel, len, txn)
    }

    /// Free a dinode block without touching quota (used when abandoning a
    /// partially constructed inode).
    pub fn free_dinode_uninit(&self, txn: &mut dyn Transaction, block: BlockNumber) -> Result<()> {
        self.withdraw().check()?;
        let rgd = self.lookup_rgrpd_or_fail(block)?;
        let guard = rgd.checkout()?;
        let rel = (block.0 - rgd.ri().data0.0) as u32;
        guard.free_dinode(rel, txn)?;
        self.space().change(0, 1, -1);
        Ok(())
    }

    /// Free a dinode block and credit its owner's quota.
    pub fn free_dinode(
        &self,
        ip: &Inode,
        txn: &mut dyn Transaction,
        block: BlockNumber,
    ) -> Result<()> {
        self.free_dinode_uninit(txn, block)?;
        self.quota().change(ip.num, -1, ip.uid, ip.gid);
        Ok(())
    }
}
