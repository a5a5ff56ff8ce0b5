//! §3 Proto and §4.4 PrioList.
//!
//! The priority-ordered singly-linked list is represented as an immutable,
//! strictly-sorted snapshot (`Arc<[Arc<Proto>]>`) exchanged under
//! [`arc_swap::ArcSwap`] — the "reader-writer exchange of a sealed
//! snapshot" §9's own design notes call out, and the exact
//! technique `link-git::odb::window::Fixed` uses for its packfile cache.
//! Readers pay one atomic load and no lock; writers clone the current
//! snapshot, mutate the clone, and publish it under `filter_chain_lock`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::chain::Chain;
use crate::error::Error;
use crate::ops::{ClassifierOps, Private};

/// One (priority, protocol, kind) classifier instance (§3).
pub struct Proto {
    pub kind: String,
    pub ops: Arc<dyn ClassifierOps>,
    pub prio: u32,
    pub protocol: u32,
    /// Strong back-reference: keeps the chain (and transitively its block)
    /// alive while any handle to this proto is held.
    pub chain: Arc<Chain>,
    private: Mutex<Option<Private>>,
    /// Guarded by the "per-proto spin lock" of §5; `AtomicBool` gives the
    /// same short-critical-section semantics without a real spinlock.
    deleting: AtomicBool,
}

impl Proto {
    pub(crate) fn new(
        kind: String,
        ops: Arc<dyn ClassifierOps>,
        prio: u32,
        protocol: u32,
        chain: Arc<Chain>,
    ) -> Result<Arc<Self>, Error> {
        let private = ops.init()?;
        Ok(Arc::new(Self {
            kind,
            ops,
            prio,
            protocol,
            chain,
            private: Mutex::new(Some(private)),
            deleting: AtomicBool::new(false),
        }))
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    fn mark_deleting(&self) {
        self.deleting.store(true, Ordering::Release);
    }

    pub fn change(&self, handle: u32, attrs: &crate::attrs::AttributeTable, replace: bool) -> Result<(), Error> {
        let mut guard = self.private.lock();
        let private = guard.as_mut().expect("proto used after destroy");
        self.ops.change(private, handle, attrs, replace)
    }

    pub fn delete_handle(&self, handle: u32) -> Result<bool, Error> {
        let mut guard = self.private.lock();
        let private = guard.as_mut().expect("proto used after destroy");
        self.ops.delete(private, handle)
    }

    pub fn get_handle(&self, handle: u32) -> Option<u32> {
        let guard = self.private.lock();
        self.ops.get(guard.as_ref().expect("proto used after destroy"), handle)
    }

    /// Invoke `ops.classify` against this instance's private payload
    /// (§4.5 step 3).
    pub fn classify(
        &self,
        packet: &crate::packet::Packet,
        result: &mut crate::packet::ClassifyResult,
    ) -> crate::packet::ActionCode {
        let guard = self.private.lock();
        let private = guard.as_ref().expect("proto used after destroy");
        self.ops.classify(packet, private, result)
    }

    /// Mirror this proto's handles to a single offload observer (§4.6
    /// Playback). Thin wrapper so [`crate::offload::OffloadBridge`] never
    /// touches `private` directly.
    pub fn reoffload(&self, add: bool, cb: &dyn crate::offload::OffloadCallback) -> Result<(), Error> {
        let guard = self.private.lock();
        let private = guard.as_ref().expect("proto used after destroy");
        self.ops.reoffload(private, add, cb)
    }

    /// `tcf_proto_is_empty` / `walker_check_empty`: a walk
    /// over every ops-owned handle finds none.
    pub fn is_empty(&self) -> bool {
        let guard = self.private.lock();
        let private = guard.as_ref().expect("proto used after destroy");
        let mut any = false;
        self.ops.walk(private, &mut |_handle| {
            any = true;
            false
        });
        !any
    }
}

impl Drop for Proto {
    fn drop(&mut self) {
        if let Some(mut private) = self.private.lock().take() {
            self.ops.destroy(&mut private);
        }
        // Balances the chain reference taken in `Chain::create_proto`: a
        // proto holds its chain alive for its whole lifetime. The
        // resulting "chain deleted"/detach transitions are the
        // control plane's concern (it observes them via `Chain::release`
        // when it explicitly drops its own handle); here we only need the
        // refcount to land back at a consistent state.
        let _ = self.chain.release(false);
    }
}

impl std::fmt::Debug for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proto")
            .field("kind", &self.kind)
            .field("prio", &self.prio)
            .field("protocol", &self.protocol)
            .field("deleting", &self.is_deleting())
            .finish()
    }
}

/// A cursor into the sorted snapshot returned by [`PrioList::find`].
pub enum FindResult {
    Exact(Arc<Proto>),
    /// No proto at `prio`; insertion point is the given index into the
    /// snapshot.
    Gap(usize),
}

/// §4.4: the strictly-priority-ordered list of protos inside one chain.
#[derive(Default)]
pub struct PrioList {
    snapshot: ArcSwap<Vec<Arc<Proto>>>,
    write_lock: Mutex<()>,
}

impl PrioList {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Lock-free read of the current ordered list of protos.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Proto>>> {
        self.snapshot.load_full()
    }

    pub fn head(&self) -> Option<Arc<Proto>> {
        self.snapshot().first().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// **Find(prio, protocol)** (§4.4): walk until `p.prio >= prio`.
    pub fn find(&self, prio: u32, protocol: u32, auto_prio: bool) -> Result<FindResult, Error> {
        let list = self.snapshot();
        for (idx, p) in list.iter().enumerate() {
            if p.prio == prio {
                if p.protocol != protocol && !auto_prio {
                    return Err(Error::Invalid("prio already used by a different protocol"));
                }
                return Ok(FindResult::Exact(Arc::clone(p)));
            }
            if p.prio > prio {
                return Ok(FindResult::Gap(idx));
            }
        }
        Ok(FindResult::Gap(list.len()))
    }

    /// Lowest existing prio minus one, seeded at `auto_prio_seed` when
    /// empty (§3 PrioList invariants, grounded in `tcf_auto_prio`).
    pub fn alloc_auto_prio(&self, seed: u32) -> u32 {
        match self.snapshot().first() {
            Some(head) => head.prio.wrapping_sub(1),
            None => seed,
        }
    }

    /// **Insert-unique(new_proto)** (§4.4): publish `proto` at its sorted
    /// position unless one already exists at `(prio, protocol)`, in which
    /// case the existing proto is returned and `proto` is dropped.
    /// `flushing` must be sampled by the caller under the same write lock
    /// used here, hence the closure: it lets [`Chain`] enforce the
    /// `flushing -> TryAgain` rule from a single critical section.
    pub fn insert_unique(
        &self,
        proto: Arc<Proto>,
        flushing: impl Fn() -> bool,
    ) -> Result<Arc<Proto>, Error> {
        let _guard = self.write_lock.lock();
        if flushing() {
            return Err(Error::TryAgain);
        }
        let current = self.snapshot();
        if let Some(existing) = current
            .iter()
            .find(|p| p.prio == proto.prio && p.protocol == proto.protocol)
        {
            return Ok(Arc::clone(existing));
        }
        let mut next: Vec<Arc<Proto>> = Vec::with_capacity(current.len() + 1);
        let mut inserted = false;
        for p in current.iter() {
            if !inserted && p.prio > proto.prio {
                next.push(Arc::clone(&proto));
                inserted = true;
            }
            next.push(Arc::clone(p));
        }
        if !inserted {
            next.push(Arc::clone(&proto));
        }
        self.snapshot.store(Arc::new(next));
        Ok(proto)
    }

    /// **Remove(proto)** (§4.4): unlink unconditionally. Returns `true` if
    /// `proto` was the head of the list before removal (caller uses this to
    /// decide whether chain-0 observers need notifying).
    pub fn remove(&self, proto: &Arc<Proto>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.snapshot();
        let was_head = current.first().map_or(false, |p| Arc::ptr_eq(p, proto));
        let next: Vec<Arc<Proto>> = current
            .iter()
            .filter(|p| !Arc::ptr_eq(p, proto))
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(next));
        was_head
    }

    /// **Delete-if-empty(proto)** (§4.4): GC a proto once its last filter
    /// handle has been removed, guarding against the stale-slot race
    /// `walker_check_empty` guards against in cls_api.c's original:
    /// `proto` must still be present, unmodified, at the moment we unlink.
    pub fn delete_if_empty(&self, proto: &Arc<Proto>) -> bool {
        let _guard = self.write_lock.lock();
        if !proto.is_empty() {
            return false;
        }
        let current = self.snapshot();
        if !current.iter().any(|p| Arc::ptr_eq(p, proto)) {
            return false;
        }
        proto.mark_deleting();
        let next: Vec<Arc<Proto>> = current
            .iter()
            .filter(|p| !Arc::ptr_eq(p, proto))
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(next));
        true
    }

    /// **flush** (§4.3): atomically swap to empty, returning the protos
    /// that were linked so the caller can drop references / notify
    /// observers.
    pub fn take_all(&self) -> Vec<Arc<Proto>> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.swap(Arc::new(Vec::new()));
        (*current).clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::ActionCode;
    use crate::testing::StubOps;

    fn fresh_chain() -> Arc<crate::chain::Chain> {
        crate::block::new_private().get_or_create_chain(0)
    }

    #[test]
    fn find_reports_gap_before_first_higher_prio() {
        let chain = fresh_chain();
        let (p100, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 100, 0x0800).unwrap();
        chain.insert_proto(p100).unwrap();

        match chain.filter_chain.find(50, 0x0800, false).unwrap() {
            FindResult::Gap(0) => {},
            FindResult::Exact(_) => panic!("expected a gap cursor, found an exact match"),
            FindResult::Gap(other) => panic!("expected Gap(0), got Gap({other})"),
        }
    }

    #[test]
    fn find_rejects_protocol_mismatch_at_same_prio() {
        let chain = fresh_chain();
        let (p, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 100, 0x0800).unwrap();
        chain.insert_proto(p).unwrap();

        let err = chain.filter_chain.find(100, 0x86dd, false).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn auto_prio_seeds_empty_chain_and_decrements_thereafter() {
        let chain = fresh_chain();
        assert_eq!(chain.filter_chain.alloc_auto_prio(0xC000_0000), 0xC000_0000);

        let (p, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 0xC000_0000, 0x0800).unwrap();
        chain.insert_proto(p).unwrap();
        assert_eq!(chain.filter_chain.alloc_auto_prio(0xC000_0000), 0xBFFF_FFFF);
    }

    #[test]
    fn insert_unique_reuses_existing_proto_at_same_slot() {
        let chain = fresh_chain();
        let (p1, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 10, 0x0800).unwrap();
        let inserted1 = chain.insert_proto(p1).unwrap();

        let (p2, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 10, 0x0800).unwrap();
        let inserted2 = chain.insert_proto(p2).unwrap();

        assert!(Arc::ptr_eq(&inserted1, &inserted2), "second insert must return the existing proto");
        assert_eq!(chain.filter_chain.snapshot().len(), 1);
    }

    #[test]
    fn priority_monotonicity_holds_after_interleaved_inserts() {
        let chain = fresh_chain();
        for prio in [300u32, 100, 200, 50] {
            let (p, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), prio, 0x0800).unwrap();
            chain.insert_proto(p).unwrap();
        }
        let snapshot = chain.filter_chain.snapshot();
        let prios: Vec<u32> = snapshot.iter().map(|p| p.prio).collect();
        assert_eq!(prios, vec![50, 100, 200, 300]);
    }

    #[test]
    fn insert_unique_rejects_into_flushing_chain() {
        let chain = fresh_chain();
        chain.flush();
        let (p, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 10, 0x0800).unwrap();
        let err = chain.insert_proto(p).unwrap_err();
        assert!(matches!(err, Error::TryAgain));
    }

    #[test]
    fn delete_if_empty_removes_only_when_no_handles_remain() {
        let chain = fresh_chain();
        let (p, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 10, 0x0800).unwrap();
        let p = chain.insert_proto(p).unwrap();
        p.change(1, &crate::attrs::AttributeTable::new(), true).unwrap();

        assert!(!chain.delete_proto_if_empty(&p), "must not delete while a handle is live");
        p.delete_handle(1).unwrap();
        assert!(chain.delete_proto_if_empty(&p), "must delete once the last handle is gone");
        assert!(p.is_deleting());
        assert!(chain.filter_chain.is_empty());
    }
}
