//! §3 Block and §4.2 Block lifecycle.
//!
//! A shared [`Block`] is looked up by index in a per-namespace [`Namespace`]
//! table, the same shape as `git::storage::fetcher::Fetchers` keys concurrent
//! lookups by `Urn` via a [`DashMap`]. Mutation of a block's chain list,
//! owner set and chain-0 observer list is serialized by `Block::inner`
//! (§5 "`block.lock` strictly covers ..."); the strong refcount is a
//! separate atomic so lookup can do an increment-if-nonzero without taking
//! that lock.

use std::collections::HashSet;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::chain::Chain;
use crate::error::Error;
use crate::proto::Proto;
pub use crate::qdisc::BinderKind;
use crate::qdisc::QdiscHandle;

/// Observer of chain 0's head (GLOSSARY "Chain-hint" neighbour: the
/// head-change broadcast of §4.2).
///
/// Registering an observer while chain 0 already has filters synchronously
/// invokes it once with the current head (§4.2).
pub trait Chain0Observer: Send + Sync {
    fn head_changed(&self, head: Option<Arc<Proto>>);
}

/// Offload bookkeeping carried on every block (§3 Block, §4.6).
#[derive(Default)]
pub struct OffloadState {
    pub nooffload_dev_count: AtomicU32,
    pub offloaded_filter_count: AtomicU32,
    /// Direct per-block driver callbacks (§4.6 Direct binding), as opposed
    /// to the netdev-keyed indirect callbacks owned by
    /// [`crate::offload::OffloadBridge`].
    pub(crate) callbacks: Mutex<Vec<Arc<dyn crate::offload::OffloadCallback>>>,
    pub keep_dst: std::sync::atomic::AtomicBool,
}

impl fmt::Debug for OffloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadState")
            .field("nooffload_dev_count", &self.nooffload_dev_count.load(Ordering::Relaxed))
            .field("offloaded_filter_count", &self.offloaded_filter_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl OffloadState {
    /// `tcf_block_offload_in_use`: a block refuses a
    /// `NotSupported` unbind demand only while it still has offloaded
    /// filters outstanding.
    pub fn in_use(&self) -> bool {
        self.offloaded_filter_count.load(Ordering::Acquire) > 0
    }
}

#[derive(Default)]
struct Inner {
    chains: Vec<Arc<Chain>>,
    chain0_observers: Vec<Arc<dyn Chain0Observer>>,
    owners: HashSet<(QdiscHandle, BinderKind)>,
}

/// §3 Block: a container of filter chains with optional shared identity.
pub struct Block {
    /// Zero means per-qdisc private; nonzero blocks live in the owning
    /// [`Namespace`]'s index table.
    pub index: u32,
    inner: Mutex<Inner>,
    /// Strong reference count with atomic increment-if-nonzero for lookup
    /// (§3 Block, §5 reclaim invariants).
    refcnt: AtomicUsize,
    pub offload: OffloadState,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("refcnt", &self.refcnt.load(Ordering::Relaxed))
            .finish()
    }
}

impl Block {
    fn new(index: u32) -> Arc<Self> {
        Arc::new(Self {
            index,
            inner: Mutex::new(Inner::default()),
            refcnt: AtomicUsize::new(1),
            offload: OffloadState::default(),
        })
    }

    pub fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Atomic increment-if-nonzero, used by [`Namespace::lookup`] so a
    /// block racing its own teardown is never resurrected.
    fn try_acquire(self: &Arc<Self>) -> bool {
        let mut cur = self.refcnt.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.refcnt.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// §4.2 `put`: drop a strong reference, tearing the block down once it
    /// reaches zero **and** its chain list is empty (grounded in the original
    /// `tcf_chain_detach`/block-put ordering).
    pub fn release(self: &Arc<Self>, namespace: Option<&Namespace>) {
        if self.refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.maybe_destroy(namespace);
    }

    /// Called from both [`Block::release`] and [`Chain::release`] whenever a
    /// chain detaches: the block is only destroyed when both the refcount
    /// *and* the chain list are empty.
    pub(crate) fn maybe_destroy(self: &Arc<Self>, namespace: Option<&Namespace>) {
        if self.refcnt.load(Ordering::Acquire) != 0 {
            return;
        }
        let empty = self.inner.lock().chains.is_empty();
        if !empty {
            return;
        }
        if let Some(ns) = namespace {
            ns.remove(self.index);
        }
        tracing::debug!(index = self.index, "block destroyed");
    }

    /// §4.2 `get_or_create`, the `requested_index != 0` branch plus owner
    /// install, minus the offload bind (performed by the caller via
    /// [`crate::offload::OffloadBridge`] so unwind order stays explicit at
    /// the call site, per §7 propagation policy).
    pub fn install_owner(&self, qdisc: QdiscHandle, binder: BinderKind) -> bool {
        self.inner.lock().owners.insert((qdisc, binder))
    }

    pub fn remove_owner(&self, qdisc: QdiscHandle, binder: BinderKind) -> bool {
        self.inner.lock().owners.remove(&(qdisc, binder))
    }

    pub fn owner_count(&self) -> usize {
        self.inner.lock().owners.len()
    }

    /// Register a chain-0 observer, synchronously replaying the current
    /// head if chain 0 already has filters (§4.2).
    pub fn add_chain0_observer(&self, observer: Arc<dyn Chain0Observer>) {
        let head = {
            let mut inner = self.inner.lock();
            inner.chain0_observers.push(Arc::clone(&observer));
            inner
                .chains
                .iter()
                .find(|c| c.index == 0)
                .map(|c| c.filter_chain.head())
        };
        if let Some(head) = head {
            observer.head_changed(head);
        }
    }

    pub fn remove_chain0_observer(&self, observer: &Arc<dyn Chain0Observer>) {
        self.inner
            .lock()
            .chain0_observers
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Broadcast a new chain-0 head. Snapshot the observer list under the
    /// lock, then dispatch unlocked (§9 Design Notes: "never traversed
    /// while holding the lock that protects the thing they observe").
    pub(crate) fn notify_chain0(&self, head: Option<Arc<Proto>>) {
        let observers = self.inner.lock().chain0_observers.clone();
        for observer in observers {
            observer.head_changed(head.clone());
        }
    }

    /// §4.3 Chain `get`: find-or-create under `block.lock`.
    pub fn get_or_create_chain(self: &Arc<Self>, index: u32) -> Arc<Chain> {
        let mut inner = self.inner.lock();
        if let Some(chain) = inner.chains.iter().find(|c| c.index == index) {
            return Arc::clone(chain);
        }
        let chain = Chain::new(Arc::clone(self), index);
        inner.chains.push(Arc::clone(&chain));
        chain
    }

    pub fn find_chain(&self, index: u32) -> Option<Arc<Chain>> {
        self.inner.lock().chains.iter().find(|c| c.index == index).cloned()
    }

    /// Detach `chain` from this block's chain list (called once its
    /// refcount reaches zero, §4.3 `put`).
    pub(crate) fn detach_chain(self: &Arc<Self>, chain: &Arc<Chain>) {
        self.inner.lock().chains.retain(|c| !Arc::ptr_eq(c, chain));
        self.maybe_destroy(None);
    }

    /// Snapshot of every chain currently attached, for dump/enumerate
    /// (§4.7 "Dump chain": "each call re-acquires references").
    pub fn chains_snapshot(&self) -> Vec<Arc<Chain>> {
        self.inner.lock().chains.clone()
    }

    pub fn chain_count(&self) -> usize {
        self.inner.lock().chains.len()
    }
}

/// §4.2: the per-namespace table of shared blocks, keyed by index.
///
/// Shaped like `git::storage::fetcher::Fetchers`: a `DashMap` behind a
/// thin newtype, sharded so concurrent control-plane threads don't
/// contend on unrelated indices.
#[derive(Default)]
pub struct Namespace {
    table: DashMap<u32, Arc<Block>, BuildHasherDefault<FxHasher>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic increment-if-nonzero lookup (§3 Block refcnt, §8 property 5:
    /// "a block is present in the table iff `shared` and `refcnt > 0`").
    pub fn lookup(&self, index: u32) -> Option<Arc<Block>> {
        let entry = self.table.get(&index)?;
        let block = Arc::clone(&entry);
        if block.try_acquire() {
            Some(block)
        } else {
            None
        }
    }

    /// §4.2 `get_or_create`: insert atomically if absent, else return the
    /// existing strong reference.
    pub fn get_or_create(&self, index: u32) -> Arc<Block> {
        debug_assert_ne!(index, 0, "index 0 is the private-block sentinel");
        if let Some(existing) = self.lookup(index) {
            return existing;
        }
        let fresh = Block::new(index);
        match self.table.entry(index) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if occ.get().try_acquire() {
                    Arc::clone(occ.get())
                } else {
                    occ.insert(Arc::clone(&fresh));
                    fresh
                }
            },
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(Arc::clone(&fresh));
                fresh
            },
        }
    }

    pub(crate) fn remove(&self, index: u32) {
        self.table.remove(&index);
    }

    pub fn contains(&self, index: u32) -> bool {
        self.table.contains_key(&index)
    }
}

/// A private (per-qdisc, `index == 0`) block, never inserted into a
/// [`Namespace`] table (§3 Block: "zero means per-qdisc private").
pub fn new_private() -> Arc<Block> {
    Block::new(0)
}
