#![forbid(unsafe_code)]
//! Interfaces to the systems surrounding the allocator and attribute code:
//! the distributed lock manager, the journal/transaction manager, quota and
//! space accounting, and the volume withdrawal service.
//!
//! The traits here define exactly what the core consumes; the provided
//! implementations (`NodeLockManager`, `MemJournal`, `NoopQuota`,
//! `MemSpaceAccounting`) cover single-node operation and the test suites.
//! A clustered deployment substitutes its DLM- and journal-backed versions.

use herd_error::{HerdError, Result};
use herd_types::{BlockNumber, Generation, InodeNumber, TxnId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ── Cluster locks ───────────────────────────────────────────────────────────

/// Namespace of a cluster lock resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Inode,
    Rgrp,
}

/// Identity of one cluster lock resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockName {
    pub kind: LockKind,
    pub addr: u64,
}

impl LockName {
    #[must_use]
    pub fn inode(ino: InodeNumber) -> Self {
        Self {
            kind: LockKind::Inode,
            addr: ino.0,
        }
    }

    #[must_use]
    pub fn rgrp(addr: BlockNumber) -> Self {
        Self {
            kind: LockKind::Rgrp,
            addr: addr.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Cluster-wide lock service.
///
/// `acquire_raw` in try mode returns `Ok(None)` when the lock is contended
/// instead of waiting; in blocking mode it returns only once granted. The
/// generation counter is observable without acquiring and increments whenever
/// a remote node's exclusive use invalidates local cached copies of the
/// protected structure.
pub trait LockManager: Send + Sync {
    fn acquire_raw(&self, name: LockName, mode: LockMode, try_only: bool) -> Result<Option<u64>>;

    fn release_raw(&self, name: LockName, mode: LockMode, token: u64);

    fn generation(&self, name: LockName) -> Generation;
}

/// Scoped hold on a cluster lock; releases on drop.
pub struct LockHold {
    mgr: Arc<dyn LockManager>,
    name: LockName,
    mode: LockMode,
    token: u64,
}

impl LockHold {
    /// Acquire `name` in `mode`. With `try_only`, returns `Ok(None)` instead
    /// of waiting behind a conflicting holder.
    pub fn acquire(
        mgr: &Arc<dyn LockManager>,
        name: LockName,
        mode: LockMode,
        try_only: bool,
    ) -> Result<Option<Self>> {
        Ok(mgr.acquire_raw(name, mode, try_only)?.map(|token| Self {
            mgr: Arc::clone(mgr),
            name,
            mode,
            token,
        }))
    }

    #[must_use]
    pub fn name(&self) -> LockName {
        self.name
    }

    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockHold {
    fn drop(&mut self) {
        self.mgr.release_raw(self.name, self.mode, self.token);
    }
}

impl std::fmt::Debug for LockHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHold")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
    generation: u64,
}

/// In-process lock manager.
///
/// Grants shared/exclusive access between threads of one node. Generations
/// only move when [`NodeLockManager::bump_generation`] is called, which test
/// code uses to simulate a remote node's exclusive use of the resource.
#[derive(Default)]
pub struct NodeLockManager {
    locks: Mutex<HashMap<LockName, LockState>>,
    released: Condvar,
    next_token: AtomicU64,
}

impl NodeLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the generation of `name`, invalidating cached copies guarded
    /// by it. Models another node taking the lock exclusively.
    pub fn bump_generation(&self, name: LockName) {
        let mut locks = self.locks.lock();
        locks.entry(name).or_default().generation += 1;
    }
}

impl LockManager for NodeLockManager {
    fn acquire_raw(&self, name: LockName, mode: LockMode, try_only: bool) -> Result<Option<u64>> {
        let mut locks = self.locks.lock();
        loop {
            let state = locks.entry(name).or_default();
            let granted = match mode {
                LockMode::Shared => !state.writer,
                LockMode::Exclusive => !state.writer && state.readers == 0,
            };
            if granted {
                match mode {
                    LockMode::Shared => state.readers += 1,
                    LockMode::Exclusive => state.writer = true,
                }
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target: "herd::cluster", ?name, ?mode, token, "lock acquired");
                return Ok(Some(token));
            }
            if try_only {
                tracing::trace!(target: "herd::cluster", ?name, ?mode, "try-lock contended");
                return Ok(None);
            }
            self.released.wait(&mut locks);
        }
    }

    fn release_raw(&self, name: LockName, mode: LockMode, _token: u64) {
        let mut locks = self.locks.lock();
        if let Some(state) = locks.get_mut(&name) {
            match mode {
                LockMode::Shared => state.readers = state.readers.saturating_sub(1),
                LockMode::Exclusive => state.writer = false,
            }
        }
        drop(locks);
        self.released.notify_all();
    }

    fn generation(&self, name: LockName) -> Generation {
        let locks = self.locks.lock();
        Generation(locks.get(&name).map_or(0, |state| state.generation))
    }
}

// ── Journal / transactions ──────────────────────────────────────────────────

/// One open journaled transaction.
///
/// Callers compute a conservative upper bound on touched blocks before
/// `begin` and must never exceed it; the journal treats an overrun as a
/// consistency failure, not a retryable condition.
pub trait Transaction: Send {
    fn id(&self) -> TxnId;

    /// Record write intent on `block`. The block's new contents become part
    /// of this transaction's atomic commit.
    fn mark_dirty(&mut self, block: BlockNumber) -> Result<()>;

    /// Cancel a pending revoke for `block` (it is being reused as metadata
    /// before the revoke went to disk).
    fn unrevoke(&mut self, block: BlockNumber);

    fn end(self: Box<Self>) -> Result<()>;
}

/// Journal service: transaction begin with precomputed block budgets.
pub trait Journal: Send + Sync {
    fn begin(&self, meta_blocks: u32, data_blocks: u32) -> Result<Box<dyn Transaction>>;
}

#[derive(Debug, Clone)]
pub struct TxnRecord {
    pub id: TxnId,
    pub dirty: Vec<BlockNumber>,
    pub unrevoked: Vec<BlockNumber>,
}

#[derive(Debug, Default)]
struct MemJournalState {
    committed: Vec<TxnRecord>,
    active: u32,
}

/// In-memory journal: tracks budgets and commit order, performs no I/O.
///
/// Dirty blocks are deduplicated before counting against the budget, the same
/// way a real journal pins a buffer once per transaction.
#[derive(Debug, Default)]
pub struct MemJournal {
    state: Arc<Mutex<MemJournalState>>,
    next_id: AtomicU64,
}

impl MemJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions committed so far, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<TxnRecord> {
        self.state.lock().committed.clone()
    }

    /// Number of transactions begun but not yet ended.
    #[must_use]
    pub fn active(&self) -> u32 {
        self.state.lock().active
    }
}

struct MemTxn {
    id: TxnId,
    budget: u32,
    dirty: Vec<BlockNumber>,
    unrevoked: Vec<BlockNumber>,
    state: Arc<Mutex<MemJournalState>>,
}

impl Transaction for MemTxn {
    fn id(&self) -> TxnId {
        self.id
    }

    fn mark_dirty(&mut self, block: BlockNumber) -> Result<()> {
        if self.dirty.contains(&block) {
            return Ok(());
        }
        if self.dirty.len() as u32 >= self.budget {
            return Err(HerdError::Corrupt {
                block: block.0,
                detail: format!(
                    "transaction {} exceeded its block budget of {}",
                    self.id, self.budget
                ),
            });
        }
        self.dirty.push(block);
        Ok(())
    }

    fn unrevoke(&mut self, block: BlockNumber) {
        self.unrevoked.push(block);
    }

    fn end(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.committed.push(TxnRecord {
            id: self.id,
            dirty: self.dirty,
            unrevoked: self.unrevoked,
        });
        Ok(())
    }
}

impl Journal for MemJournal {
    fn begin(&self, meta_blocks: u32, data_blocks: u32) -> Result<Box<dyn Transaction>> {
        let id = TxnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let budget = meta_blocks + data_blocks;
        if budget == 0 {
            return Err(HerdError::InvalidArgument(
                "transaction with zero block budget".to_owned(),
            ));
        }
        self.state.lock().active += 1;
        tracing::trace!(target: "herd::cluster", id = id.0, meta_blocks, data_blocks, "txn begin");
        Ok(Box::new(MemTxn {
            id,
            budget,
            dirty: Vec::new(),
            unrevoked: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }
}

// ── Quota ───────────────────────────────────────────────────────────────────

/// Quota accounting hooks. All methods take the owning identity so the
/// implementation can track per-uid/per-gid usage.
pub trait QuotaService: Send + Sync {
    fn hold(&self, ino: InodeNumber) -> Result<()>;
    fn unhold(&self, ino: InodeNumber);
    fn lock(&self, ino: InodeNumber) -> Result<()>;
    fn unlock(&self, ino: InodeNumber);
    fn check(&self, ino: InodeNumber, uid: u32, gid: u32) -> Result<()>;
    fn change(&self, ino: InodeNumber, delta: i64, uid: u32, gid: u32);
}

/// Quota disabled: every hold/check succeeds, changes are dropped.
#[derive(Debug, Default)]
pub struct NoopQuota;

impl QuotaService for NoopQuota {
    fn hold(&self, _ino: InodeNumber) -> Result<()> {
        Ok(())
    }
    fn unhold(&self, _ino: InodeNumber) {}
    fn lock(&self, _ino: InodeNumber) -> Result<()> {
        Ok(())
    }
    fn unlock(&self, _ino: InodeNumber) {}
    fn check(&self, _ino: InodeNumber, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }
    fn change(&self, _ino: InodeNumber, _delta: i64, _uid: u32, _gid: u32) {}
}

// ── Space accounting ────────────────────────────────────────────────────────

/// Volume-wide block usage counters (statfs feed).
pub trait SpaceAccounting: Send + Sync {
    fn change(&self, meta_delta: i64, free_delta: i64, dinode_delta: i64);
}

#[derive(Debug, Default)]
pub struct MemSpaceAccounting {
    meta: AtomicI64,
    free: AtomicI64,
    dinodes: AtomicI64,
}

impl MemSpaceAccounting {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn totals(&self) -> (i64, i64, i64) {
        (
            self.meta.load(Ordering::Relaxed),
            self.free.load(Ordering::Relaxed),
            self.dinodes.load(Ordering::Relaxed),
        )
    }
}

impl SpaceAccounting for MemSpaceAccounting {
    fn change(&self, meta_delta: i64, free_delta: i64, dinode_delta: i64) {
        self.meta.fetch_add(meta_delta, Ordering::Relaxed);
        self.free.fetch_add(free_delta, Ordering::Relaxed);
        self.dinodes.fetch_add(dinode_delta, Ordering::Relaxed);
    }
}

// ── Withdrawal ──────────────────────────────────────────────────────────────

/// Fatal-error state of one volume.
///
/// The first consistency error marks the volume withdrawn; the host maps that
/// to read-only or fully offline. Non-fatal assertion-style diagnostics go
/// through the bounded-rate warning log instead.
#[derive(Debug)]
pub struct WithdrawState {
    withdrawn: AtomicBool,
    last_warning: Mutex<Option<Instant>>,
    complain_interval: Duration,
}

impl Default for WithdrawState {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl WithdrawState {
    #[must_use]
    pub fn new(complain_interval: Duration) -> Self {
        Self {
            withdrawn: AtomicBool::new(false),
            last_warning: Mutex::new(None),
            complain_interval,
        }
    }

    #[must_use]
    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn.load(Ordering::Acquire)
    }

    /// Fail with [`HerdError::Withdrawn`] if the volume has already withdrawn.
    pub fn check(&self) -> Result<()> {
        if self.is_withdrawn() {
            Err(HerdError::Withdrawn)
        } else {
            Ok(())
        }
    }

    /// Record an unrecoverable consistency failure. Returns true if this call
    /// performed the withdrawal (false if the volume was already down).
    pub fn consistency_error(&self, scope: &str) -> bool {
        let first = !self.withdrawn.swap(true, Ordering::AcqRel);
        if first {
            tracing::error!(target: "herd::cluster", scope, "filesystem consistency error, withdrawing volume");
        }
        first
    }

    /// Log a non-fatal diagnostic, rate-limited to one per complain interval.
    /// Returns true if the message was actually emitted.
    pub fn warn_limited(&self, scope: &str, message: &str) -> bool {
        let mut last = self.last_warning.lock();
        let now = Instant::now();
        if let Some(prev) = *last
            && now.duration_since(prev) < self.complain_interval
        {
            return false;
        }
        *last = Some(now);
        drop(last);
        tracing::warn!(target: "herd::cluster", scope, message, "assertion warning");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn mgr() -> Arc<dyn LockManager> {
        Arc::new(NodeLockManager::new())
    }

    #[test]
    fn shared_holders_coexist_exclusive_does_not() {
        let mgr = mgr();
        let name = LockName::rgrp(BlockNumber(17));

        let a = LockHold::acquire(&mgr, name, LockMode::Shared, false)
            .unwrap()
            .unwrap();
        let b = LockHold::acquire(&mgr, name, LockMode::Shared, true)
            .unwrap()
            .unwrap();
        assert!(
            LockHold::acquire(&mgr, name, LockMode::Exclusive, true)
                .unwrap()
                .is_none()
        );

        drop(a);
        drop(b);
        assert!(
            LockHold::acquire(&mgr, name, LockMode::Exclusive, true)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn try_exclusive_fails_under_exclusive() {
        let mgr = mgr();
        let name = LockName::inode(InodeNumber(5));

        let hold = LockHold::acquire(&mgr, name, LockMode::Exclusive, false)
            .unwrap()
            .unwrap();
        assert!(
            LockHold::acquire(&mgr, name, LockMode::Exclusive, true)
                .unwrap()
                .is_none()
        );
        assert!(
            LockHold::acquire(&mgr, name, LockMode::Shared, true)
                .unwrap()
                .is_none()
        );
        drop(hold);
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let mgr = mgr();
        let name = LockName::rgrp(BlockNumber(9));

        let hold = LockHold::acquire(&mgr, name, LockMode::Exclusive, false)
            .unwrap()
            .unwrap();

        let mgr2 = Arc::clone(&mgr);
        let waiter = thread::spawn(move || {
            let hold = LockHold::acquire(&mgr2, name, LockMode::Exclusive, false)
                .unwrap()
                .unwrap();
            drop(hold);
        });

        thread::sleep(Duration::from_millis(20));
        drop(hold);
        waiter.join().unwrap();
    }

    #[test]
    fn generation_moves_only_on_bump() {
        let node = Arc::new(NodeLockManager::new());
        let name = LockName::rgrp(BlockNumber(3));
        assert_eq!(node.generation(name), Generation(0));

        let mgr: Arc<dyn LockManager> = node.clone();
        let hold = LockHold::acquire(&mgr, name, LockMode::Exclusive, false)
            .unwrap()
            .unwrap();
        drop(hold);
        assert_eq!(node.generation(name), Generation(0));

        node.bump_generation(name);
        assert_eq!(node.generation(name), Generation(1));
    }

    #[test]
    fn txn_budget_enforced() {
        let journal = MemJournal::new();
        let mut txn = journal.begin(2, 0).unwrap();
        txn.mark_dirty(BlockNumber(1)).unwrap();
        txn.mark_dirty(BlockNumber(1)).unwrap(); // same block, no extra budget
        txn.mark_dirty(BlockNumber(2)).unwrap();

        let err = txn.mark_dirty(BlockNumber(3)).unwrap_err();
        assert!(err.is_fatal());
        txn.end().unwrap();

        let committed = journal.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].dirty, vec![BlockNumber(1), BlockNumber(2)]);
    }

    #[test]
    fn txn_zero_budget_rejected() {
        let journal = MemJournal::new();
        assert!(journal.begin(0, 0).is_err());
    }

    #[test]
    fn withdraw_is_sticky_and_first_caller_wins() {
        let state = WithdrawState::default();
        assert!(state.check().is_ok());
        assert!(state.consistency_error("rgrp"));
        assert!(!state.consistency_error("rgrp"));
        assert!(state.is_withdrawn());
        assert!(matches!(state.check(), Err(HerdError::Withdrawn)));
    }

    #[test]
    fn warnings_are_rate_limited() {
        let state = WithdrawState::new(Duration::from_secs(60));
        assert!(state.warn_limited("test", "first"));
        assert!(!state.warn_limited("test", "second"));
    }
}
