//! In-memory test doubles, in the spirit of `librad::net::protocol`'s test
//! fixtures and `link-tracking`'s in-memory `odb`/`refdb` fakes: a trivial
//! `ClassifierOps` stub (kind `"stub"`) driving handles off a counter, a
//! `RecordingOffloadObserver` capturing bind/unbind/filter-change calls in
//! order, and no-op `ControlChannel`/`BlockResolver` doubles for tests that
//! only care about the object graph, not the notification wiring.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::attrs::AttributeTable;
use crate::block::Block;
use crate::control::{BlockResolver, ChainEvent, ControlChannel, FilterEvent};
use crate::error::Error;
use crate::offload::{FilterChange, OffloadCallback};
use crate::ops::{ClassifierOps, Private};
use crate::packet::{ActionCode, ClassifyResult, Packet};

/// A classifier whose `classify` outcome is scripted per-instance, for
/// exercising the dispatcher (§4.5) without a real classifier kind.
pub struct StubOps {
    kind: &'static str,
    pub outcome: ActionCode,
    pub goto_index: Option<u32>,
}

impl StubOps {
    pub fn new(kind: &'static str, outcome: ActionCode) -> Arc<Self> {
        Arc::new(Self { kind, outcome, goto_index: None })
    }

    pub fn goto(kind: &'static str, goto_index: u32) -> Arc<Self> {
        Arc::new(Self { kind, outcome: ActionCode::GotoChain, goto_index: Some(goto_index) })
    }
}

/// Per-proto state for [`StubOps`]: a set of live handles, assigned from a
/// monotonic counter so `walk`/`get`/`delete` have something to report.
struct StubPrivate {
    handles: HashSet<u32>,
}

impl ClassifierOps for StubOps {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn init(&self) -> Result<Private, Error> {
        Ok(Box::new(StubPrivate { handles: HashSet::new() }))
    }

    fn destroy(&self, _private: &mut Private) {}

    fn classify(&self, _packet: &Packet, _private: &Private, result: &mut ClassifyResult) -> ActionCode {
        result.goto_index = self.goto_index;
        self.outcome
    }

    fn change(&self, private: &mut Private, handle: u32, _attrs: &AttributeTable, _replace: bool) -> Result<(), Error> {
        let state = private.downcast_mut::<StubPrivate>().expect("stub private type");
        state.handles.insert(handle);
        Ok(())
    }

    fn delete(&self, private: &mut Private, handle: u32) -> Result<bool, Error> {
        let state = private.downcast_mut::<StubPrivate>().expect("stub private type");
        if !state.handles.remove(&handle) {
            return Err(Error::NotFound("handle"));
        }
        Ok(state.handles.is_empty())
    }

    fn get(&self, private: &Private, handle: u32) -> Option<u32> {
        let state = private.downcast_ref::<StubPrivate>().expect("stub private type");
        state.handles.get(&handle).copied()
    }

    fn walk(&self, private: &Private, visit: &mut dyn FnMut(u32) -> bool) {
        let state = private.downcast_ref::<StubPrivate>().expect("stub private type");
        for &h in &state.handles {
            if !visit(h) {
                break;
            }
        }
    }

    fn reoffload(&self, _private: &Private, _add: bool, _cb: &dyn OffloadCallback) -> Result<(), Error> {
        Ok(())
    }

    fn tmplt_create(&self, _attrs: &AttributeTable) -> Result<Private, Error> {
        Ok(Box::new(()))
    }

    fn tmplt_destroy(&self, _private: &mut Private) {}

    fn tmplt_dump(&self, _private: &Private) -> AttributeTable {
        AttributeTable::new()
    }
}

/// A classifier whose `reoffload` can be told to fail on a specific
/// handle, for exercising [`crate::offload::OffloadBridge`]'s rollback.
pub struct FailingReoffloadOps {
    kind: &'static str,
    pub fail: AtomicU32,
}

impl FailingReoffloadOps {
    pub fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Self { kind, fail: AtomicU32::new(u32::MAX) })
    }
}

impl ClassifierOps for FailingReoffloadOps {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn init(&self) -> Result<Private, Error> {
        Ok(Box::new(StubPrivate { handles: HashSet::new() }))
    }

    fn destroy(&self, _private: &mut Private) {}

    fn classify(&self, _packet: &Packet, _private: &Private, _result: &mut ClassifyResult) -> ActionCode {
        ActionCode::Ok
    }

    fn change(&self, private: &mut Private, handle: u32, _attrs: &AttributeTable, _replace: bool) -> Result<(), Error> {
        let state = private.downcast_mut::<StubPrivate>().expect("stub private type");
        state.handles.insert(handle);
        Ok(())
    }

    fn delete(&self, private: &mut Private, handle: u32) -> Result<bool, Error> {
        let state = private.downcast_mut::<StubPrivate>().expect("stub private type");
        state.handles.remove(&handle);
        Ok(state.handles.is_empty())
    }

    fn get(&self, private: &Private, handle: u32) -> Option<u32> {
        let state = private.downcast_ref::<StubPrivate>().expect("stub private type");
        state.handles.get(&handle).copied()
    }

    fn walk(&self, private: &Private, visit: &mut dyn FnMut(u32) -> bool) {
        let state = private.downcast_ref::<StubPrivate>().expect("stub private type");
        for &h in &state.handles {
            if !visit(h) {
                break;
            }
        }
    }

    fn reoffload(&self, _private: &Private, _add: bool, _cb: &dyn OffloadCallback) -> Result<(), Error> {
        Err(Error::NotSupported("scripted reoffload failure"))
    }

    fn tmplt_create(&self, _attrs: &AttributeTable) -> Result<Private, Error> {
        Ok(Box::new(()))
    }

    fn tmplt_destroy(&self, _private: &mut Private) {}

    fn tmplt_dump(&self, _private: &Private) -> AttributeTable {
        AttributeTable::new()
    }
}

/// One recorded offload event, in call order (§8 property 9).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OffloadEvent {
    Bind(u32),
    Unbind(u32),
    Filter(bool),
}

/// Captures every bind/unbind/filter-change call it receives, for
/// asserting the replay round-trip property (§8 property 9).
#[derive(Default)]
pub struct RecordingOffloadObserver {
    events: Mutex<Vec<OffloadEvent>>,
}

impl RecordingOffloadObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<OffloadEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl OffloadCallback for RecordingOffloadObserver {
    fn block_bind(&self, block_index: u32) -> Result<(), Error> {
        self.events.lock().unwrap().push(OffloadEvent::Bind(block_index));
        Ok(())
    }

    fn block_unbind(&self, block_index: u32) {
        self.events.lock().unwrap().push(OffloadEvent::Unbind(block_index));
    }

    fn filter_change(&self, change: &FilterChange) -> Result<(), Error> {
        self.events.lock().unwrap().push(OffloadEvent::Filter(change.add));
        Ok(())
    }
}

/// A `ControlChannel` that silently drops every notification, for tests
/// that only assert on the object graph.
#[derive(Default)]
pub struct NullChannel;

impl ControlChannel for NullChannel {
    fn chain_added(&self, _block_index: u32, _chain_index: u32) {}
    fn chain_deleted(&self, _block_index: u32, _chain_index: u32) {}
    fn chain_notify(&self, _block_index: u32, _chain_index: u32, _event: ChainEvent) {}
    fn filter_notify(&self, _block_index: u32, _chain_index: u32, _prio: u32, _protocol: u32, _kind: &str, _event: FilterEvent) {}
}

/// A `ControlChannel` that records every notification, in order.
#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ControlChannel for RecordingChannel {
    fn chain_added(&self, block_index: u32, chain_index: u32) {
        self.events.lock().unwrap().push(format!("chain_added({block_index},{chain_index})"));
    }

    fn chain_deleted(&self, block_index: u32, chain_index: u32) {
        self.events.lock().unwrap().push(format!("chain_deleted({block_index},{chain_index})"));
    }

    fn chain_notify(&self, block_index: u32, chain_index: u32, event: ChainEvent) {
        self.events.lock().unwrap().push(format!("chain_notify({block_index},{chain_index},{event:?})"));
    }

    fn filter_notify(
        &self,
        block_index: u32,
        chain_index: u32,
        prio: u32,
        protocol: u32,
        kind: &str,
        event: FilterEvent,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(format!("filter_notify({block_index},{chain_index},{prio},{protocol},{kind},{event:?})"));
    }
}

/// A `BlockResolver` backed by a single fixed private block, for tests that
/// exercise the `BlockRef::Ifindex` path without a real qdisc subsystem.
pub struct FixedBlockResolver {
    pub ifindex: u32,
    pub parent: u32,
    pub block: Arc<Block>,
}

impl FixedBlockResolver {
    pub fn new(ifindex: u32, parent: u32) -> Arc<Self> {
        Arc::new(Self { ifindex, parent, block: crate::block::new_private() })
    }
}

impl BlockResolver for FixedBlockResolver {
    fn private_block(&self, ifindex: u32, parent: u32) -> Option<Arc<Block>> {
        if ifindex == self.ifindex && parent == self.parent {
            Some(Arc::clone(&self.block))
        } else {
            None
        }
    }
}

/// A `BlockResolver` with no private blocks at all, for tests that only
/// exercise shared (`BlockRef::Index`) blocks.
#[derive(Default)]
pub struct NoPrivateBlocks;

impl BlockResolver for NoPrivateBlocks {
    fn private_block(&self, _ifindex: u32, _parent: u32) -> Option<Arc<Block>> {
        None
    }
}
