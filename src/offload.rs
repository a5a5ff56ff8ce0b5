//! §4.6 OffloadBridge: direct per-block binding plus indirect
//! per-netdev binding, with playback on late registration.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::block::Block;
use crate::error::Error;
use crate::qdisc::{NetdevCaps, NetdevHandle};

/// A single descriptor of a classifier-filter change, mirrored to offload
/// observers during playback (§4.6 "Playback on late register").
#[derive(Clone, Debug)]
pub struct FilterChange {
    pub chain_index: u32,
    pub prio: u32,
    pub protocol: u32,
    pub kind: &'static str,
    pub add: bool,
}

/// An offload observer: a hardware driver or other indirect-bind
/// registrant mirroring classifier state (GLOSSARY "Offload callback").
pub trait OffloadCallback: Send + Sync {
    fn block_bind(&self, block_index: u32) -> Result<(), Error>;
    fn block_unbind(&self, block_index: u32);
    fn filter_change(&self, change: &FilterChange) -> Result<(), Error>;
}

struct IndirectEntry {
    refcount: u32,
    callbacks: Vec<Arc<dyn OffloadCallback>>,
    bound_block: Option<Arc<Block>>,
}

/// §4.6: the two-dimensional offload protocol. One bridge is shared across
/// a [`crate::Namespace`], the way `librad::git::storage::fetcher::Fetchers`
/// is shared across a storage pool.
#[derive(Default)]
pub struct OffloadBridge {
    indirect: Mutex<FxHashMap<NetdevHandle, IndirectEntry>>,
}

impl OffloadBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.6 Direct binding: call `netdev.setup_tc(BIND, ...)` (modeled here
    /// as driving every already-registered callback through `block_bind`),
    /// tolerating or failing on a refusal per `can_offload`.
    ///
    /// "If a block already has offloaded filters AND a device refuses
    /// offload, binding fails with `NotSupported`" (§4.6).
    #[tracing::instrument(level = "debug", skip(self, block))]
    pub fn bind(&self, block: &Arc<Block>, caps: NetdevCaps) -> Result<(), Error> {
        if !caps.supports_offload {
            if block.offload.in_use() {
                return Err(Error::NotSupported("device does not support offload"));
            }
            block.offload.nooffload_dev_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            return Ok(());
        }
        if !caps.can_offload {
            if block.offload.in_use() {
                return Err(Error::NotSupported("device refuses offload with filters present"));
            }
            block.offload.nooffload_dev_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            return Ok(());
        }
        let callbacks = block.offload.callbacks.lock().clone();
        for cb in &callbacks {
            cb.block_bind(block.index)?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, block))]
    pub fn unbind(&self, block: &Block) {
        let callbacks = block.offload.callbacks.lock().clone();
        for cb in &callbacks {
            cb.block_unbind(block.index);
        }
    }

    /// Register a direct per-block callback (as opposed to an indirect,
    /// netdev-keyed one); playback follows the same walk as
    /// [`OffloadBridge::register_indirect`].
    pub fn register_direct(&self, block: &Arc<Block>, cb: Arc<dyn OffloadCallback>) -> Result<(), Error> {
        block.offload.callbacks.lock().push(Arc::clone(&cb));
        self.playback(block, &cb)
    }

    pub fn unregister_direct(&self, block: &Block, cb: &Arc<dyn OffloadCallback>) {
        block.offload.callbacks.lock().retain(|c| !Arc::ptr_eq(c, cb));
    }

    /// §4.6 Indirect binding: register `cb` against `netdev`. If the netdev
    /// already has a bound ingress block, immediately replay a BIND plus a
    /// full playback so the callback observes the live state.
    #[tracing::instrument(level = "debug", skip(self, cb))]
    pub fn register_indirect(
        &self,
        netdev: NetdevHandle,
        cb: Arc<dyn OffloadCallback>,
    ) -> Result<(), Error> {
        let bound_block = {
            let mut table = self.indirect.lock();
            let entry = table.entry(netdev).or_insert_with(|| IndirectEntry {
                refcount: 0,
                callbacks: Vec::new(),
                bound_block: None,
            });
            entry.refcount += 1;
            entry.callbacks.push(Arc::clone(&cb));
            entry.bound_block.clone()
        };

        if let Some(block) = bound_block {
            cb.block_bind(block.index)?;
            self.playback(&block, &cb)?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, cb))]
    pub fn unregister_indirect(&self, netdev: NetdevHandle, cb: &Arc<dyn OffloadCallback>) {
        let bound_block = {
            let mut table = self.indirect.lock();
            if let Some(entry) = table.get_mut(&netdev) {
                entry.callbacks.retain(|c| !Arc::ptr_eq(c, cb));
                entry.refcount = entry.refcount.saturating_sub(1);
                let bound_block = entry.bound_block.clone();
                if entry.refcount == 0 {
                    table.remove(&netdev);
                }
                bound_block
            } else {
                None
            }
        };
        if let Some(block) = bound_block {
            self.reverse_playback(&block, cb);
            cb.block_unbind(block.index);
        }
    }

    /// Record which netdev's ingress block is `block`, so future
    /// registrations on that netdev replay immediately.
    pub fn bind_indirect_netdev(&self, netdev: NetdevHandle, block: Arc<Block>) {
        let mut table = self.indirect.lock();
        let entry = table.entry(netdev).or_insert_with(|| IndirectEntry {
            refcount: 0,
            callbacks: Vec::new(),
            bound_block: None,
        });
        entry.bound_block = Some(block);
    }

    pub fn unbind_indirect_netdev(&self, netdev: NetdevHandle) {
        if let Some(entry) = self.indirect.lock().get_mut(&netdev) {
            entry.bound_block = None;
        }
    }

    /// §4.6 "Playback on late register": walk every (chain, proto) pair of
    /// `block` and invoke `ops.reoffload(add=true, cb)`. On failure, walk
    /// back over the already-played entries with `add=false` before
    /// returning the error — the round-trip §8 property 9 exercises.
    fn playback(&self, block: &Arc<Block>, cb: &Arc<dyn OffloadCallback>) -> Result<(), Error> {
        let mut played: Vec<Arc<crate::proto::Proto>> = Vec::new();
        for chain in block.chains_snapshot() {
            for proto in chain.filter_chain.snapshot().iter() {
                match proto.reoffload(true, cb.as_ref()) {
                    Ok(()) => played.push(Arc::clone(proto)),
                    Err(e) => {
                        for done in played.iter().rev() {
                            let _ = done.reoffload(false, cb.as_ref());
                        }
                        return Err(e);
                    },
                }
            }
        }
        Ok(())
    }

    fn reverse_playback(&self, block: &Block, cb: &Arc<dyn OffloadCallback>) {
        let chains = block.chains_snapshot();
        for chain in chains.iter().rev() {
            let snapshot = chain.filter_chain.snapshot();
            for proto in snapshot.iter().rev() {
                let _ = proto.reoffload(false, cb.as_ref());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    use super::*;
    use crate::attrs::AttributeTable;
    use crate::ops::{ClassifierOps, Private};
    use crate::packet::{ActionCode, ClassifyResult, Packet};
    use crate::testing::{OffloadEvent, RecordingOffloadObserver};

    /// A classifier whose `reoffload` relays to the callback's
    /// `filter_change`, optionally failing on `add` (for exercising
    /// [`OffloadBridge`]'s rollback, §8 property 9).
    struct RelayOps {
        label: &'static str,
        fail_on_add: AtomicBool,
    }

    impl RelayOps {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Self { label, fail_on_add: AtomicBool::new(false) })
        }

        fn failing(label: &'static str) -> Arc<Self> {
            Arc::new(Self { label, fail_on_add: AtomicBool::new(true) })
        }
    }

    impl ClassifierOps for RelayOps {
        fn kind(&self) -> &'static str {
            self.label
        }

        fn init(&self) -> Result<Private, Error> {
            Ok(Box::new(()))
        }

        fn destroy(&self, _private: &mut Private) {}

        fn classify(&self, _packet: &Packet, _private: &Private, _result: &mut ClassifyResult) -> ActionCode {
            ActionCode::Ok
        }

        fn change(&self, _private: &mut Private, _handle: u32, _attrs: &AttributeTable, _replace: bool) -> Result<(), Error> {
            Ok(())
        }

        fn delete(&self, _private: &mut Private, _handle: u32) -> Result<bool, Error> {
            Ok(true)
        }

        fn get(&self, _private: &Private, _handle: u32) -> Option<u32> {
            None
        }

        fn walk(&self, _private: &Private, _visit: &mut dyn FnMut(u32) -> bool) {}

        fn reoffload(&self, _private: &Private, add: bool, cb: &dyn OffloadCallback) -> Result<(), Error> {
            if add && self.fail_on_add.load(AtomicOrdering::SeqCst) {
                return Err(Error::NotSupported("scripted reoffload failure"));
            }
            cb.filter_change(&FilterChange { chain_index: 0, prio: 0, protocol: 0, kind: self.label, add })
        }

        fn tmplt_create(&self, _attrs: &AttributeTable) -> Result<Private, Error> {
            Ok(Box::new(()))
        }

        fn tmplt_destroy(&self, _private: &mut Private) {}

        fn tmplt_dump(&self, _private: &Private) -> AttributeTable {
            AttributeTable::new()
        }
    }

    #[test]
    fn register_direct_replays_every_proto_in_priority_order() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let (a, _) = chain.create_proto("a".into(), RelayOps::new("a"), 10, 0x0800).unwrap();
        chain.insert_proto(a).unwrap();
        let (b, _) = chain.create_proto("b".into(), RelayOps::new("b"), 20, 0x0800).unwrap();
        chain.insert_proto(b).unwrap();

        let bridge = OffloadBridge::new();
        let observer = RecordingOffloadObserver::new();
        bridge.register_direct(&block, observer.clone()).unwrap();

        assert_eq!(observer.events(), vec![OffloadEvent::Filter(true), OffloadEvent::Filter(true)]);
    }

    #[test]
    fn register_direct_rolls_back_already_played_entries_on_failure() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let (a, _) = chain.create_proto("a".into(), RelayOps::new("a"), 10, 0x0800).unwrap();
        chain.insert_proto(a).unwrap();
        let (b, _) = chain.create_proto("b".into(), RelayOps::failing("b"), 20, 0x0800).unwrap();
        chain.insert_proto(b).unwrap();

        let bridge = OffloadBridge::new();
        let observer = RecordingOffloadObserver::new();
        let err = bridge.register_direct(&block, observer.clone()).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));

        assert_eq!(observer.events(), vec![OffloadEvent::Filter(true), OffloadEvent::Filter(false)]);
    }

    #[test]
    fn register_indirect_replays_bind_and_playback_when_netdev_already_bound() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let (a, _) = chain.create_proto("a".into(), RelayOps::new("a"), 10, 0x0800).unwrap();
        chain.insert_proto(a).unwrap();

        let bridge = OffloadBridge::new();
        let netdev = NetdevHandle(42);
        bridge.bind_indirect_netdev(netdev, Arc::clone(&block));

        let observer = RecordingOffloadObserver::new();
        bridge.register_indirect(netdev, observer.clone()).unwrap();

        assert_eq!(observer.events(), vec![OffloadEvent::Bind(block.index), OffloadEvent::Filter(true)]);
    }

    #[test]
    fn unregister_indirect_reverse_plays_before_unbind() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let (a, _) = chain.create_proto("a".into(), RelayOps::new("a"), 10, 0x0800).unwrap();
        chain.insert_proto(a).unwrap();
        let (b, _) = chain.create_proto("b".into(), RelayOps::new("b"), 20, 0x0800).unwrap();
        chain.insert_proto(b).unwrap();

        let bridge = OffloadBridge::new();
        let netdev = NetdevHandle(7);
        bridge.bind_indirect_netdev(netdev, Arc::clone(&block));

        let concrete = RecordingOffloadObserver::new();
        let handle: Arc<dyn OffloadCallback> = concrete.clone();
        bridge.register_indirect(netdev, Arc::clone(&handle)).unwrap();
        bridge.unregister_indirect(netdev, &handle);

        assert_eq!(
            concrete.events(),
            vec![
                OffloadEvent::Bind(block.index),
                OffloadEvent::Filter(true),
                OffloadEvent::Filter(true),
                OffloadEvent::Filter(false),
                OffloadEvent::Filter(false),
                OffloadEvent::Unbind(block.index),
            ],
        );
    }
}
