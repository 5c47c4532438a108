//! Per-volume session.
//!
//! Owns the resource index and the allocator's scan state, and ties the
//! group descriptors to the cluster collaborators. One `Volume` exists per
//! mount; dropping it tears everything down. There are no process-wide
//! singletons.

use crate::rgrp::{ResourceGroup, RgrpGuard};
use crate::rindex::{RindexSource, parse_rindex};
use herd_block::BlockDevice;
use herd_cluster::{
    Journal, LockHold, LockManager, LockMode, LockName, QuotaService, SpaceAccounting,
    WithdrawState,
};
use herd_error::{HerdError, Result};
use herd_types::{BlockNumber, Generation, InodeNumber, VolumeGeometry};
use parking_lot::Mutex;
use std::sync::Arc;

/// Collaborator services a volume is mounted against.
#[derive(Clone)]
pub struct Services {
    pub dev: Arc<dyn BlockDevice>,
    pub locks: Arc<dyn LockManager>,
    pub journal: Arc<dyn Journal>,
    pub quota: Arc<dyn QuotaService>,
    pub space: Arc<dyn SpaceAccounting>,
    pub withdraw: Arc<WithdrawState>,
}

/// Index and scan state guarded by the volume's short-section mutex.
///
/// Never held across I/O or cluster-lock acquisition.
#[derive(Default)]
pub(crate) struct IndexState {
    /// Groups in on-disk index order.
    pub groups: Vec<Arc<ResourceGroup>>,
    /// Lookup acceleration: group indices, most recently hit first.
    pub mru: Vec<usize>,
    /// Recently successful groups (indices), oldest first.
    pub recent: Vec<usize>,
    /// Round-robin cursor for the full-list scan.
    pub forward: Option<usize>,
}

pub struct Volume {
    geo: VolumeGeometry,
    services: Services,
    rindex_lock: LockName,
    rindex_source: Arc<dyn RindexSource>,
    pub(crate) state: Mutex<IndexState>,
    /// Serializes index reloads; holds the generation the index was last
    /// read under. `None` until the first load.
    reload_gate: Mutex<Option<Generation>>,
}

impl Volume {
    pub fn new(
        geo: VolumeGeometry,
        services: Services,
        rindex_ino: InodeNumber,
        rindex_source: Arc<dyn RindexSource>,
    ) -> Self {
        Self {
            geo,
            services,
            rindex_lock: LockName::inode(rindex_ino),
            rindex_source,
            state: Mutex::new(IndexState::default()),
            reload_gate: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geo
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.services.dev
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.services.locks
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.services.journal
    }

    #[must_use]
    pub fn quota(&self) -> &Arc<dyn QuotaService> {
        &self.services.quota
    }

    #[must_use]
    pub fn space(&self) -> &Arc<dyn SpaceAccounting> {
        &self.services.space
    }

    #[must_use]
    pub fn withdraw(&self) -> &Arc<WithdrawState> {
        &self.services.withdraw
    }

    /// Take the resource index lock shared and make sure the in-memory group
    /// list matches the index file's current generation.
    ///
    /// The hold is kept for the whole of an allocation operation; it is
    /// shared, so this is cheap. It only goes exclusive elsewhere when the
    /// volume is grown, which is what moves the generation and triggers the
    /// reload here.
    pub fn hold_rindex(&self) -> Result<LockHold> {
        let hold = must_grant(LockHold::acquire(
            &self.services.locks,
            self.rindex_lock,
            LockMode::Shared,
            false,
        )?)?;

        let generation = self.services.locks.generation(self.rindex_lock);
        let mut gate = self.reload_gate.lock();
        if *gate != Some(generation) {
            self.reload_index()?;
            *gate = Some(generation);
        }
        Ok(hold)
    }

    /// Rebuild the group list from the index file. Idempotent; callers
    /// serialize on the reload gate.
    fn reload_index(&self) -> Result<()> {
        let bytes = self.rindex_source.read_all()?;
        let entries = parse_rindex(&bytes).map_err(|err| {
            self.services.withdraw.consistency_error("rindex");
            err
        })?;

        let mut groups = Vec::with_capacity(entries.len());
        for entry in entries {
            groups.push(ResourceGroup::new(
                entry,
                Arc::clone(&self.services.dev),
                Arc::clone(&self.services.locks),
                Arc::clone(&self.services.withdraw),
            )?);
        }

        tracing::debug!(target: "herd::rgrp", groups = groups.len(), "resource index loaded");

        let mut state = self.state.lock();
        state.mru = (0..groups.len()).collect();
        state.recent.clear();
        state.forward = None;
        state.groups = groups;
        Ok(())
    }

    /// Find the group whose data extent contains `block`, promoting it in the
    /// MRU ordering so nearby lookups stay fast.
    #[must_use]
    pub fn lookup_rgrp(&self, block: BlockNumber) -> Option<Arc<ResourceGroup>> {
        let mut state = self.state.lock();
        let pos = state
            .mru
            .iter()
            .position(|&gidx| state.groups[gidx].ri().contains(block))?;
        let gidx = state.mru.remove(pos);
        state.mru.insert(0, gidx);
        Some(Arc::clone(&state.groups[gidx]))
    }

    /// Snapshot of the group list in on-disk index order.
    #[must_use]
    pub fn groups(&self) -> Vec<Arc<ResourceGroup>> {
        self.state.lock().groups.clone()
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Allocation state of one block (diagnostic). The caller is responsible
    /// for holding the owning group's lock if a stable answer is needed.
    pub fn block_state(&self, block: BlockNumber) -> Result<u8> {
        let rgd = self.lookup_rgrpd_or_fail(block)?;
        let guard = rgd.checkout()?;
        let rel = (block.0 - rgd.ri().data0.0) as u32;
        guard.block_state(rel)
    }

    /// Lookup that treats a miss as corruption: the caller derived `block`
    /// from on-disk metadata, so it must belong to some group.
    pub(crate) fn lookup_rgrpd_or_fail(&self, block: BlockNumber) -> Result<Arc<ResourceGroup>> {
        self.lookup_rgrp(block).ok_or_else(|| {
            self.services.withdraw.consistency_error("rindex lookup");
            HerdError::Corrupt {
                block: block.0,
                detail: "block not covered by any resource group".to_owned(),
            }
        })
    }
}

/// A blocking acquire is defined to grant; `None` from one means the lock
/// service broke its contract.
pub(crate) fn must_grant(hold: Option<LockHold>) -> Result<LockHold> {
    hold.ok_or_else(|| {
        HerdError::InvalidArgument("blocking lock acquire returned no grant".to_owned())
    })
}

/// Set of distinct resource groups backing a run of blocks, for operations
/// that free blocks spread across several groups in one transaction.
#[derive(Default)]
pub struct RgrpList {
    rgds: Vec<Arc<ResourceGroup>>,
}

impl RgrpList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the group owning `block`, ignoring duplicates.
    pub fn add(&mut self, vol: &Volume, block: BlockNumber) -> Result<()> {
        let rgd = vol.lookup_rgrpd_or_fail(block)?;
        if !self
            .rgds
            .iter()
            .any(|existing| existing.ri().addr == rgd.ri().addr)
        {
            self.rgds.push(rgd);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rgds.is_empty()
    }

    /// Total header+bitmap blocks across the listed groups, for transaction
    /// sizing.
    #[must_use]
    pub fn bitmap_blocks(&self) -> u32 {
        self.rgds.iter().map(|rgd| rgd.ri().length).sum()
    }

    /// Lock every listed group exclusively (blocking) and check out its
    /// buffers. Groups are taken in address order so concurrent callers
    /// cannot deadlock against each other.
    pub fn acquire(mut self, vol: &Volume) -> Result<RgrpHolds> {
        self.rgds.sort_by_key(|rgd| rgd.ri().addr);
        let mut entries = Vec::with_capacity(self.rgds.len());
        for rgd in self.rgds {
            let hold = must_grant(LockHold::acquire(
                vol.locks(),
                rgd.lock_name(),
                LockMode::Exclusive,
                false,
            )?)?;
            let guard = rgd.checkout()?;
            entries.push((rgd, hold, guard));
        }
        Ok(RgrpHolds { entries })
    }
}

/// Exclusive holds plus buffer checkouts on a set of groups.
pub struct RgrpHolds {
    entries: Vec<(Arc<ResourceGroup>, LockHold, RgrpGuard)>,
}

impl RgrpHolds {
    /// The checked-out guard for the group containing `block`.
    #[must_use]
    pub fn guard_for(&self, block: BlockNumber) -> Option<&RgrpGuard> {
        self.entries
            .iter()
            .find(|(rgd, _, _)| rgd.ri().contains(block))
            .map(|(_, _, guard)| guard)
    }

    /// Refresh every held group's clone shadows; call after the transaction
    /// that mutated them has committed.
    pub fn refresh_clones(&self) {
        for (_, _, guard) in &self.entries {
            guard.refresh_clones();
        }
    }
}
