//! Allocation reservations and group selection.
//!
//! A reservation pins one resource group — index lock shared, group lock
//! exclusive, buffers checked out — for the duration of a single high-level
//! operation. Selection tries recently successful groups first with
//! non-blocking locks, then falls back to a circular walk of the full list
//! seeded from this node's journal slot so different nodes start their scans
//! in different places.

use crate::inode::Inode;
use crate::rgrp::{ResourceGroup, RgrpGuard};
use crate::volume::{Volume, must_grant};
use herd_cluster::{LockHold, LockMode};
use herd_error::{HerdError, Result};
use std::sync::Arc;

/// Transient record of one operation's block demand against its chosen
/// group. Invariant: consumed ≤ requested.
pub struct Reservation {
    requested: u32,
    consumed: u32,
    rgd: Option<Arc<ResourceGroup>>,
    guard: Option<RgrpGuard>,
    rg_hold: Option<LockHold>,
    ri_hold: Option<LockHold>,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("requested", &self.requested)
            .field("consumed", &self.consumed)
            .field("rgd", &self.rgd.as_ref().map(|r| r.ri().addr))
            .finish_non_exhaustive()
    }
}

impl Reservation {
    #[must_use]
    pub fn requested(&self) -> u32 {
        self.requested
    }

    #[must_use]
    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    #[must_use]
    pub fn rgd(&self) -> Option<&Arc<ResourceGroup>> {
        self.rgd.as_ref()
    }

    pub(crate) fn guard(&self) -> Result<&RgrpGuard> {
        self.guard.as_ref().ok_or_else(|| {
            HerdError::InvalidArgument("allocation without a reserved resource group".to_owned())
        })
    }

    pub(crate) fn note_consumed(&mut self) {
        self.consumed += 1;
    }
}

impl Volume {
    /// Reserve room for `requested` blocks: hold the resource index, pick a
    /// group with enough committed free space, and lock it exclusively.
    pub fn reserve_space(&self, ip: &mut Inode, requested: u32) -> Result<Reservation> {
        self.withdraw().check()?;
        if requested == 0 {
            return Err(HerdError::InvalidArgument(
                "reservation for zero blocks".to_owned(),
            ));
        }

        let ri_hold = self.hold_rindex()?;
        let (rgd, guard, rg_hold) = self.select_rgrp(ip, requested)?;

        tracing::debug!(
            target: "herd::rgrp",
            inode = ip.num.0,
            requested,
            rgrp = rgd.ri().addr.0,
            "space reserved"
        );

        Ok(Reservation {
            requested,
            consumed: 0,
            rgd: Some(rgd),
            guard: Some(guard),
            rg_hold: Some(rg_hold),
            ri_hold: Some(ri_hold),
        })
    }

    /// Release a reservation after its transaction has ended: refresh the
    /// group's clone shadows, then drop the group and index holds.
    ///
    /// Consuming more than was requested means the transaction's block budget
    /// was undersized, which is a consistency failure.
    pub fn release_reservation(&self, mut res: Reservation) -> Result<()> {
        if res.consumed > res.requested {
            self.withdraw().consistency_error("reservation");
            return Err(HerdError::Corrupt {
                block: res.rgd.as_ref().map_or(0, |r| r.ri().addr.0),
                detail: format!(
                    "reservation consumed {} of {} requested blocks",
                    res.consumed, res.requested
                ),
            });
        }

        if let Some(guard) = res.guard.take() {
            guard.refresh_clones();
        }
        res.rgd = None;
        res.rg_hold = None;
        res.ri_hold = None;
        Ok(())
    }

    /// Choose and lock a group for allocation, avoiding contention with
    /// other nodes where possible.
    fn select_rgrp(
        &self,
        ip: &mut Inode,
        requested: u32,
    ) -> Result<(Arc<ResourceGroup>, RgrpGuard, LockHold)> {
        // Pass 1: recently successful groups, try-locks only.
        let mut cursor = self.recent_first(ip.last_alloc_group);
        while let Some(gidx) = cursor {
            let Some(rgd) = self.group_at(gidx) else {
                break;
            };
            match LockHold::acquire(self.locks(), rgd.lock_name(), LockMode::Exclusive, true)? {
                Some(hold) => {
                    let guard = rgd.checkout()?;
                    if guard.fits(requested) {
                        ip.last_alloc_group = Some(rgd.ri().addr.0);
                        return Ok((rgd, guard, hold));
                    }
                    // Locked but too full: retire it from the recent list.
                    drop(guard);
                    drop(hold);
                    cursor = self.recent_next(gidx, true);
                }
                None => cursor = self.recent_next(gidx, false),
            }
        }

        // Pass 2: full list, circularly from the forward cursor. First
        // circuit skips contended groups; if any were skipped, one more
        // circuit with blocking locks before giving up.
        let group_count = self.group_count();
        if group_count == 0 {
            return Err(HerdError::NoSpace);
        }
        let begin = self.forward_start(group_count);
        let mut gidx = begin;
        let mut try_only = true;
        let mut skipped = 0_u32;
        let mut loops = 0_u32;

        loop {
            if let Some(rgd) = self.group_at(gidx) {
                let acquired = if try_only {
                    LockHold::acquire(self.locks(), rgd.lock_name(), LockMode::Exclusive, true)?
                } else {
                    Some(must_grant(LockHold::acquire(
                        self.locks(),
                        rgd.lock_name(),
                        LockMode::Exclusive,
                        false,
                    )?)?)
                };
                match acquired {
                    Some(hold) => {
                        let guard = rgd.checkout()?;
                        if guard.fits(requested) {
                            ip.last_alloc_group = Some(rgd.ri().addr.0);
                            self.recent_add(gidx);
                            self.forward_set((gidx + 1) % group_count);
                            return Ok((rgd, guard, hold));
                        }
                        drop(guard);
                        drop(hold);
                    }
                    None => skipped += 1,
                }
            }

            gidx = (gidx + 1) % group_count;
            if gidx == begin {
                loops += 1;
                if loops >= 2 || skipped == 0 {
                    tracing::debug!(
                        target: "herd::rgrp",
                        inode = ip.num.0,
                        requested,
                        loops,
                        skipped,
                        "allocation scan exhausted"
                    );
                    return Err(HerdError::NoSpace);
                }
                try_only = false;
            }
        }
    }

    fn group_at(&self, gidx: usize) -> Option<Arc<ResourceGroup>> {
        self.state.lock().groups.get(gidx).cloned()
    }

    /// First recent-list candidate: the group that last worked for this
    /// entity if it is still listed, else the list head.
    fn recent_first(&self, last_addr: Option<u64>) -> Option<usize> {
        let state = self.state.lock();
        if state.recent.is_empty() {
            return None;
        }
        if let Some(addr) = last_addr
            && let Some(&gidx) = state
                .recent
                .iter()
                .find(|&&gidx| state.groups[gidx].ri().addr.0 == addr)
        {
            return Some(gidx);
        }
        state.recent.first().copied()
    }

    /// Candidate after `cur` in the recent list, optionally retiring `cur`.
    /// Falls back to the head if `cur` was concurrently removed.
    fn recent_next(&self, cur: usize, remove: bool) -> Option<usize> {
        let mut state = self.state.lock();
        match state.recent.iter().position(|&gidx| gidx == cur) {
            Some(pos) => {
                let next = state.recent.get(pos + 1).copied();
                if remove {
                    state.recent.remove(pos);
                }
                next
            }
            None => state.recent.first().copied(),
        }
    }

    /// Record a success at the recent-list tail, bounded to
    /// groups ÷ journals entries with the oldest evicted.
    fn recent_add(&self, gidx: usize) {
        let journals = self.geometry().journal_count.max(1) as usize;
        let mut state = self.state.lock();
        let max = state.groups.len() / journals;
        if max == 0 || state.recent.contains(&gidx) {
            return;
        }
        if state.recent.len() >= max {
            state.recent.remove(0);
        }
        state.recent.push(gidx);
    }

    /// Current forward cursor, initializing it from this node's journal slot
    /// so nodes spread their scan starting points across the volume.
    fn forward_start(&self, group_count: usize) -> usize {
        let mut state = self.state.lock();
        if let Some(forward) = state.forward
            && forward < group_count
        {
            return forward;
        }
        let journals = self.geometry().journal_count.max(1) as usize;
        let slot = self.geometry().journal_slot.0 as usize;
        let begin = if group_count >= journals {
            group_count * slot / journals
        } else {
            0
        };
        state.forward = Some(begin);
        begin
    }

    fn forward_set(&self, gidx: usize) {
        self.state.lock().forward = Some(gidx);
    }
}
