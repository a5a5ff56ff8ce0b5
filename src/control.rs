//! §4.7 ControlPlane: the create/update/delete/get/dump command handlers,
//! plus the §4.7 "Replay protocol" that intercepts `TryAgain` and restarts
//! the whole handler (§7: "`TryAgain` is intercepted by the replay loop and
//! never leaks").
//!
//! The qdisc/netdev/namespace subsystem and the wire-attribute codec are
//! external collaborators (§1); this module only consumes them through
//! [`BlockResolver`] and the parsed [`AttributeTable`]/[`Flags`] types.

use std::sync::Arc;

use itertools::Itertools as _;

use crate::attrs::{AttributeTable, Flags};
use crate::block::{BinderKind, Block, Namespace};
use crate::chain::Chain;
use crate::config::Config;
use crate::error::Error;
use crate::offload::OffloadBridge;
use crate::ops::{ClassifierOps, Lookup, OpsRegistry};
use crate::proto::{FindResult, Proto};
use crate::qdisc::{NetdevCaps, QdiscHandle};

/// Chain index must fit this mask (§4.7 prologue step 5, §6 `CHAIN` tag).
pub const TC_ACT_EXT_VAL_MASK: u32 = 0x0FFF_FFFF;

/// §6 sentinel selecting a block by `block_index` alone.
pub const MAGIC_BLOCK: u32 = 0xFFFF_FFFF;

/// The admin capability on the originating user-namespace (§4.7 prologue
/// step 1). Real namespace/capability plumbing is out of scope (§1); this
/// is the narrow boolean the prologue actually branches on.
#[derive(Clone, Copy, Debug, Default)]
pub struct Caller {
    pub is_admin: bool,
}

impl Caller {
    pub fn admin() -> Self {
        Self { is_admin: true }
    }

    pub fn unprivileged() -> Self {
        Self { is_admin: false }
    }
}

fn require_admin(caller: Caller) -> Result<(), Error> {
    if caller.is_admin {
        Ok(())
    } else {
        Err(Error::Permission)
    }
}

fn validate_chain_index(index: u32) -> Result<(), Error> {
    if index > TC_ACT_EXT_VAL_MASK {
        Err(Error::Invalid("chain index exceeds upper limit"))
    } else {
        Ok(())
    }
}

/// §4.7 prologue step 3: how a command names its block.
#[derive(Clone, Copy, Debug)]
pub enum BlockRef {
    /// Resolved directly in the shared [`Namespace`] table.
    Index(u32),
    /// Resolved via the (out-of-scope) qdisc/netdev path: "device->qdisc->class".
    Ifindex { ifindex: u32, parent: u32 },
}

/// §6: build a [`BlockRef`] from a message header's `(ifindex, block_index,
/// parent)` triple, honoring the `MAGIC_BLOCK` sentinel.
pub fn block_ref_from_header(ifindex: u32, block_index: u32, parent: u32) -> Result<BlockRef, Error> {
    if ifindex == MAGIC_BLOCK || block_index != 0 {
        if block_index == 0 {
            return Err(Error::Invalid("block index required when selecting by block index"));
        }
        Ok(BlockRef::Index(block_index))
    } else {
        Ok(BlockRef::Ifindex { ifindex, parent })
    }
}

/// §1 "qdisc/netdev/namespace plumbing... exposed as qdisc and netdev
/// handles with a narrow lookup interface": the one capability
/// [`ControlPlane`] needs from that subsystem besides the shared
/// [`Namespace`] table.
pub trait BlockResolver: Send + Sync {
    /// The per-qdisc private block attached at `(ifindex, parent)`, if any.
    fn private_block(&self, ifindex: u32, parent: u32) -> Option<Arc<Block>>;

    /// `q->flags &= ~TCQ_F_CAN_BYPASS` (§4.7 NewFilter): only meaningful
    /// for a private (non-shared) block, hence keyed the same way as
    /// `private_block`. A default no-op lets tests that don't care about
    /// the hint skip implementing it.
    fn clear_can_bypass(&self, _ifindex: u32, _parent: u32) {}
}

/// What happened to a filter, reported to [`ControlChannel::filter_notify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterEvent {
    Changed { echo: bool },
    Deleted,
    Unicast,
}

/// What happened to a chain, reported to [`ControlChannel::chain_notify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    New,
    Deleted,
    Get,
}

/// The control channel's notification surface (§6, §4.2-§4.3): everything
/// [`ControlPlane`] needs to broadcast, independent of the wire codec.
pub trait ControlChannel: Send + Sync {
    fn chain_added(&self, block_index: u32, chain_index: u32);
    fn chain_deleted(&self, block_index: u32, chain_index: u32);
    fn chain_notify(&self, block_index: u32, chain_index: u32, event: ChainEvent);
    fn filter_notify(
        &self,
        block_index: u32,
        chain_index: u32,
        prio: u32,
        protocol: u32,
        kind: &str,
        event: FilterEvent,
    );
}

#[derive(Clone, Debug)]
pub struct NewFilterRequest {
    pub caller: Caller,
    pub block: BlockRef,
    pub chain: u32,
    /// 0 requests auto-allocation (§3 PrioList invariants).
    pub prio: u32,
    pub protocol: u32,
    pub handle: u32,
    pub kind: String,
    pub attrs: AttributeTable,
    pub flags: Flags,
}

#[derive(Clone, Debug)]
pub struct DelFilterRequest {
    pub caller: Caller,
    pub block: BlockRef,
    pub chain: u32,
    /// 0 with no kind/handle/protocol requests a full chain flush (§4.7 DelFilter).
    pub prio: u32,
    pub protocol: u32,
    pub handle: u32,
    pub kind: Option<String>,
}

#[derive(Clone, Debug)]
pub struct GetFilterRequest {
    pub block: BlockRef,
    pub chain: u32,
    pub prio: u32,
    pub protocol: u32,
    pub handle: u32,
}

#[derive(Clone, Debug)]
pub struct ChainRequest {
    pub caller: Caller,
    pub block: BlockRef,
    pub chain: u32,
    pub flags: Flags,
}

#[derive(Clone, Debug)]
pub struct NewChainRequest {
    pub chain: ChainRequest,
    /// `KIND` attribute present on a NEW carrying a template (§4.7).
    pub template: Option<AttributeTable>,
}

#[derive(Clone, Debug, Default)]
pub struct DumpCursor {
    pub offset: usize,
}

pub struct DumpPage<T> {
    pub items: Vec<T>,
    pub done: bool,
}

#[derive(Clone, Debug)]
pub struct FilterSummary {
    pub chain_index: u32,
    pub prio: u32,
    pub protocol: u32,
    pub kind: String,
}

#[derive(Clone, Debug)]
pub struct ChainSummary {
    pub index: u32,
    pub template_kind: Option<String>,
}

/// §4.7: the control-plane command surface over a single [`Namespace`].
pub struct ControlPlane {
    pub namespace: Arc<Namespace>,
    pub registry: OpsRegistry,
    pub offload: Arc<OffloadBridge>,
    pub config: Config,
    channel: Arc<dyn ControlChannel>,
}

impl ControlPlane {
    pub fn new(namespace: Arc<Namespace>, offload: Arc<OffloadBridge>, channel: Arc<dyn ControlChannel>) -> Self {
        Self {
            namespace,
            registry: OpsRegistry::new(),
            offload,
            config: Config::default(),
            channel,
        }
    }

    fn resolve_block(&self, resolver: &dyn BlockResolver, block_ref: BlockRef) -> Result<Arc<Block>, Error> {
        match block_ref {
            BlockRef::Index(idx) => self.namespace.lookup(idx).ok_or(Error::NotFound("block")),
            BlockRef::Ifindex { ifindex, parent } => {
                resolver.private_block(ifindex, parent).ok_or(Error::NotFound("block"))
            },
        }
    }

    /// The single-level restart loop of §4.7 "Replay protocol" / §9 Design
    /// Notes ("not a fixpoint"): replays the whole handler whenever it
    /// returns `TryAgain`, forcing `rtnl_held = true` the way the original
    /// forces `rtnl_lock()` before the second attempt. Bounded defensively
    /// so a latent bug in a handler can't spin this thread forever; real
    /// contention is bounded by module-load frequency (§9), far below this.
    fn replay<T>(&self, mut f: impl FnMut(bool) -> Result<T, Error>) -> Result<T, Error> {
        const MAX_REPLAYS: u32 = 64;
        let mut rtnl_held = false;
        for attempt in 0.. {
            match f(rtnl_held) {
                Err(Error::TryAgain) => {
                    if attempt >= MAX_REPLAYS {
                        tracing::error!("exceeded replay safety cap, giving up");
                        return Err(Error::TryAgain);
                    }
                    tracing::warn!(attempt, "command hit a transient conflict, replaying");
                    rtnl_held = true;
                    continue;
                },
                other => return other,
            }
        }
        unreachable!()
    }

    #[tracing::instrument(level = "debug", skip(self, resolver, req))]
    pub fn new_filter(&self, resolver: &dyn BlockResolver, req: NewFilterRequest) -> Result<u32, Error> {
        self.replay(|_rtnl_held| self.new_filter_once(resolver, &req))
    }

    fn new_filter_once(&self, resolver: &dyn BlockResolver, req: &NewFilterRequest) -> Result<u32, Error> {
        require_admin(req.caller)?;
        validate_chain_index(req.chain)?;
        let block = self.resolve_block(resolver, req.block)?;
        let chain = block.get_or_create_chain(req.chain);
        chain.set_channel(Arc::clone(&self.channel));

        let prio_allocate = req.prio == 0;
        if prio_allocate && !req.flags.contains(Flags::CREATE) {
            return Err(Error::Invalid("prio 0 requires CREATE to auto-allocate"));
        }
        let prio = if prio_allocate {
            chain.filter_chain.alloc_auto_prio(self.config.auto_prio_seed)
        } else {
            req.prio
        };

        let (proto, created) = match chain.filter_chain.find(prio, req.protocol, prio_allocate)? {
            FindResult::Exact(p) => (p, false),
            FindResult::Gap(_) => {
                if chain.is_flushing() {
                    return Err(Error::TryAgain);
                }
                if req.kind.is_empty() || req.protocol == 0 {
                    return Err(Error::Invalid("filter kind and protocol must be specified"));
                }
                if !req.flags.contains(Flags::CREATE) {
                    return Err(Error::NotFound("need CREATE to create a new filter"));
                }
                let ops = self.lookup_ops(&req.kind)?;
                let (new_proto, first_ref) = chain.create_proto(req.kind.clone(), ops, prio, req.protocol)?;
                if first_ref {
                    self.channel.chain_added(block.index, chain.index);
                }
                match chain.insert_proto(Arc::clone(&new_proto)) {
                    Ok(inserted) => (inserted, true),
                    Err(e) => {
                        chain.delete_proto_if_empty(&new_proto);
                        return Err(e);
                    },
                }
            },
        };

        if let Some(tmplt) = chain.template() {
            if tmplt.kind() != proto.kind.as_str() {
                if created {
                    chain.delete_proto_if_empty(&proto);
                }
                return Err(Error::Invalid("chain template is set to a different filter kind"));
            }
        }

        // `tc_new_tfilter` rejects EXCL against an already-present handle
        // before ever calling into `ops->change` (cls_api.c ~2205-2210).
        if req.flags.contains(Flags::EXCL) && proto.get_handle(req.handle).is_some() {
            if created {
                chain.delete_proto_if_empty(&proto);
            }
            return Err(Error::Exists("filter handle already exists"));
        }

        match proto.change(req.handle, &req.attrs, req.flags.contains(Flags::CREATE)) {
            Ok(()) => {
                self.channel.filter_notify(
                    block.index,
                    chain.index,
                    proto.prio,
                    proto.protocol,
                    &proto.kind,
                    FilterEvent::Changed { echo: req.flags.contains(Flags::ECHO) },
                );
                if let BlockRef::Ifindex { ifindex, parent } = req.block {
                    resolver.clear_can_bypass(ifindex, parent);
                }
                Ok(proto.prio)
            },
            Err(e) => {
                if created {
                    chain.delete_proto_if_empty(&proto);
                }
                Err(e)
            },
        }
    }

    #[tracing::instrument(level = "debug", skip(self, resolver, req))]
    pub fn del_filter(&self, resolver: &dyn BlockResolver, req: DelFilterRequest) -> Result<(), Error> {
        self.replay(|_rtnl_held| self.del_filter_once(resolver, &req))
    }

    fn del_filter_once(&self, resolver: &dyn BlockResolver, req: &DelFilterRequest) -> Result<(), Error> {
        require_admin(req.caller)?;
        validate_chain_index(req.chain)?;
        let block = self.resolve_block(resolver, req.block)?;

        let chain = match block.find_chain(req.chain) {
            Some(c) => {
                c.set_channel(Arc::clone(&self.channel));
                c
            },
            None => {
                if req.prio == 0 {
                    // "User requested flush on non-existent chain. Nothing
                    // to do" (grounded in cls_api.c's tc_del_tfilter).
                    return Ok(());
                }
                return Err(Error::NotFound("filter chain"));
            },
        };

        if req.prio == 0 {
            self.channel.chain_notify(block.index, chain.index, ChainEvent::Deleted);
            let removed = chain.flush();
            chain.end_flush();
            drop(removed);
            return Ok(());
        }

        let proto = match chain.filter_chain.find(req.prio, req.protocol, false)? {
            FindResult::Exact(p) => p,
            FindResult::Gap(_) => {
                return Err(Error::NotFound("filter with specified priority/protocol not found"))
            },
        };
        if let Some(kind) = &req.kind {
            if kind != &proto.kind {
                return Err(Error::Invalid("specified filter kind does not match existing one"));
            }
        }

        if req.handle == 0 {
            chain.remove_proto(&proto);
            self.channel
                .filter_notify(block.index, chain.index, proto.prio, proto.protocol, &proto.kind, FilterEvent::Deleted);
            return Ok(());
        }

        if proto.get_handle(req.handle).is_none() {
            return Err(Error::NotFound("specified filter handle not found"));
        }
        let last = proto.delete_handle(req.handle)?;
        self.channel
            .filter_notify(block.index, chain.index, proto.prio, proto.protocol, &proto.kind, FilterEvent::Deleted);
        if last {
            chain.delete_proto_if_empty(&proto);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, resolver, req))]
    pub fn get_filter(&self, resolver: &dyn BlockResolver, req: GetFilterRequest) -> Result<Option<u32>, Error> {
        self.replay(|_rtnl_held| self.get_filter_once(resolver, &req))
    }

    fn get_filter_once(&self, resolver: &dyn BlockResolver, req: &GetFilterRequest) -> Result<Option<u32>, Error> {
        validate_chain_index(req.chain)?;
        let block = self.resolve_block(resolver, req.block)?;
        let chain = block.find_chain(req.chain).ok_or(Error::NotFound("filter chain"))?;
        let proto = match chain.filter_chain.find(req.prio, req.protocol, false)? {
            FindResult::Exact(p) => p,
            FindResult::Gap(_) => {
                return Err(Error::NotFound("filter with specified priority/protocol not found"))
            },
        };
        let handle = proto.get_handle(req.handle);
        self.channel
            .filter_notify(block.index, chain.index, proto.prio, proto.protocol, &proto.kind, FilterEvent::Unicast);
        Ok(handle)
    }

    #[tracing::instrument(level = "debug", skip(self, resolver, req))]
    pub fn new_chain(&self, resolver: &dyn BlockResolver, req: NewChainRequest) -> Result<(), Error> {
        self.replay(|_rtnl_held| self.new_chain_once(resolver, &req))
    }

    fn new_chain_once(&self, resolver: &dyn BlockResolver, req: &NewChainRequest) -> Result<(), Error> {
        require_admin(req.chain.caller)?;
        validate_chain_index(req.chain.chain)?;
        let block = self.resolve_block(resolver, req.chain.block)?;

        let chain = match block.find_chain(req.chain.chain) {
            Some(existing) => {
                if existing.is_visible() {
                    return Err(Error::Exists("filter chain already exists"));
                }
                existing
            },
            None => {
                if !req.chain.flags.contains(Flags::CREATE) {
                    return Err(Error::NotFound("need CREATE to create a new chain"));
                }
                block.get_or_create_chain(req.chain.chain)
            },
        };
        chain.set_channel(Arc::clone(&self.channel));

        // Unlike filter creation, `NewChain` does not route through
        // `Chain::create_proto`'s "first reference -> chain added" notice
        // (the original's `tcf_chain_create` sets `refcnt = 1`
        // directly, bypassing `tcf_chain_get`). The one hold taken here is
        // the permanent "explicitly created" reference released by `del_chain`.
        chain.acquire(false);
        chain.mark_explicitly_created();

        if let Some(tmplt_attrs) = &req.template {
            // Collected in a closure rather than using `?` directly so every
            // failure inside (missing KIND, `lookup_ops` TryAgain, a failing
            // `tmplt_create`, or `set_template` itself) runs through the one
            // `chain.release` below instead of leaking the reference `acquire`
            // took above.
            let attach = || -> Result<(), Error> {
                let kind = tmplt_attrs
                    .get_str(crate::attrs::Tag::Kind)
                    .ok_or(Error::Invalid("template requires a KIND attribute"))?;
                let ops = self.lookup_ops(kind)?;
                let private = ops.tmplt_create(tmplt_attrs)?;
                chain.set_template(ops, private)
            };
            if let Err(e) = attach() {
                chain.release(false);
                return Err(e);
            }
        }

        self.channel.chain_notify(block.index, chain.index, ChainEvent::New);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, resolver, req))]
    pub fn del_chain(&self, resolver: &dyn BlockResolver, req: ChainRequest) -> Result<(), Error> {
        self.replay(|_rtnl_held| self.del_chain_once(resolver, &req))
    }

    fn del_chain_once(&self, resolver: &dyn BlockResolver, req: &ChainRequest) -> Result<(), Error> {
        require_admin(req.caller)?;
        validate_chain_index(req.chain)?;
        let block = self.resolve_block(resolver, req.block)?;
        let chain = block
            .find_chain(req.chain)
            .filter(|c| c.is_visible())
            .ok_or(Error::Invalid("cannot find specified filter chain"))?;
        chain.set_channel(Arc::clone(&self.channel));

        self.channel.chain_notify(block.index, chain.index, ChainEvent::Deleted);
        let removed = chain.flush();
        chain.end_flush();
        drop(removed);
        chain.release(false);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, resolver, req))]
    pub fn get_chain(&self, resolver: &dyn BlockResolver, req: ChainRequest) -> Result<ChainSummary, Error> {
        self.replay(|_rtnl_held| self.get_chain_once(resolver, &req))
    }

    fn get_chain_once(&self, resolver: &dyn BlockResolver, req: &ChainRequest) -> Result<ChainSummary, Error> {
        validate_chain_index(req.chain)?;
        let block = self.resolve_block(resolver, req.block)?;
        let chain = block
            .find_chain(req.chain)
            .filter(|c| c.is_visible())
            .ok_or(Error::Invalid("cannot find specified filter chain"))?;
        self.channel.chain_notify(block.index, chain.index, ChainEvent::Get);
        Ok(ChainSummary { index: chain.index, template_kind: chain.template().map(|o| o.kind().to_string()) })
    }

    /// §4.7 Dump filter: resumable, snapshot-tolerant iteration over one
    /// chain's protos.
    pub fn dump_filter(
        &self,
        resolver: &dyn BlockResolver,
        block_ref: BlockRef,
        chain_index: u32,
        cursor: &mut DumpCursor,
        max_items: usize,
    ) -> Result<DumpPage<FilterSummary>, Error> {
        let block = self.resolve_block(resolver, block_ref)?;
        let chain = block.find_chain(chain_index).ok_or(Error::NotFound("filter chain"))?;
        let snapshot = chain.filter_chain.snapshot();
        let mut items = Vec::new();
        let mut idx = cursor.offset;
        while idx < snapshot.len() && items.len() < max_items {
            let p = &snapshot[idx];
            items.push(FilterSummary {
                chain_index: chain.index,
                prio: p.prio,
                protocol: p.protocol,
                kind: p.kind.clone(),
            });
            idx += 1;
        }
        cursor.offset = idx;
        Ok(DumpPage { done: idx >= snapshot.len(), items })
    }

    /// §4.7 Dump chain: resumable iteration over a block's visible chains
    /// (§8 property 6: action-only chains are excluded).
    pub fn dump_chain(
        &self,
        resolver: &dyn BlockResolver,
        block_ref: BlockRef,
        cursor: &mut DumpCursor,
        max_items: usize,
    ) -> Result<DumpPage<ChainSummary>, Error> {
        let block = self.resolve_block(resolver, block_ref)?;
        let snapshot: Vec<Arc<Chain>> = block
            .chains_snapshot()
            .into_iter()
            .filter(|c| c.is_visible())
            .sorted_by_key(|c| c.index)
            .collect();
        let mut items = Vec::new();
        let mut idx = cursor.offset;
        while idx < snapshot.len() && items.len() < max_items {
            let c = &snapshot[idx];
            items.push(ChainSummary { index: c.index, template_kind: c.template().map(|o| o.kind().to_string()) });
            idx += 1;
        }
        cursor.offset = idx;
        Ok(DumpPage { done: idx >= snapshot.len(), items })
    }

    /// §4.1 lookup wrapper translating [`Lookup::TryAgain`] into the
    /// crate-wide [`Error::TryAgain`] the replay loop understands.
    fn lookup_ops(&self, kind: &str) -> Result<Arc<dyn ClassifierOps>, Error> {
        match self.registry.lookup(kind) {
            Lookup::Found(ops) => Ok(ops),
            Lookup::NotFound => Err(Error::NotFound("classifier kind")),
            Lookup::TryAgain => Err(Error::TryAgain),
        }
    }
}

/// §4.2 `get_or_create` / `put`: block attach/detach for a given qdisc,
/// including the direct-offload bind/unbind (§4.6) in the documented
/// unwind order (§7: "offload unbind -> head-change observer remove ->
/// owner remove -> refcount drop").
pub struct BlockAttachment;

impl BlockAttachment {
    /// Attach `block` (looked up or created by the caller) to `qdisc` under
    /// `binder`, installing the owner entry and performing the offload
    /// bind. On failure, unwinds in strict reverse order.
    pub fn attach(
        offload: &OffloadBridge,
        block: &Arc<Block>,
        qdisc: QdiscHandle,
        binder: BinderKind,
        netdev_caps: NetdevCaps,
    ) -> Result<(), Error> {
        block.install_owner(qdisc, binder);
        if let Err(e) = offload.bind(block, netdev_caps) {
            block.remove_owner(qdisc, binder);
            return Err(e);
        }
        Ok(())
    }

    /// §4.2 `put`: remove the owner and offload-unbind, then drop the
    /// strong reference (performed by the caller via [`Block::release`],
    /// kept as a separate step so unwind order stays explicit here too).
    pub fn detach(offload: &OffloadBridge, block: &Arc<Block>, namespace: &Namespace, qdisc: QdiscHandle, binder: BinderKind) {
        block.remove_owner(qdisc, binder);
        offload.unbind(block);
        block.release(Some(namespace));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::ActionCode;
    use crate::testing::{NoPrivateBlocks, RecordingChannel, StubOps};

    fn plane_with_block(index: u32) -> (ControlPlane, Arc<Namespace>) {
        let namespace = Arc::new(Namespace::new());
        namespace.get_or_create(index);
        let plane = ControlPlane::new(Arc::clone(&namespace), Arc::new(OffloadBridge::new()), RecordingChannel::new());
        (plane, namespace)
    }

    fn new_filter_req(kind: &str, block: u32, chain: u32, prio: u32, protocol: u32, handle: u32) -> NewFilterRequest {
        NewFilterRequest {
            caller: Caller::admin(),
            block: BlockRef::Index(block),
            chain,
            prio,
            protocol,
            handle,
            kind: kind.to_string(),
            attrs: AttributeTable::new(),
            flags: Flags::CREATE,
        }
    }

    #[test]
    fn new_filter_rejects_an_unprivileged_caller() {
        let (plane, _ns) = plane_with_block(1);
        plane.registry.register(StubOps::new("s1-unpriv", ActionCode::Ok)).unwrap();
        let mut req = new_filter_req("s1-unpriv", 1, 0, 100, 0x0800, 1);
        req.caller = Caller::unprivileged();
        let err = plane.new_filter(&NoPrivateBlocks, req).unwrap_err();
        assert!(matches!(err, Error::Permission));
    }

    #[test]
    fn new_filter_rejects_a_chain_index_past_the_mask() {
        let (plane, _ns) = plane_with_block(1);
        plane.registry.register(StubOps::new("s1-chainmask", ActionCode::Ok)).unwrap();
        let req = new_filter_req("s1-chainmask", 1, TC_ACT_EXT_VAL_MASK + 1, 100, 0x0800, 1);
        let err = plane.new_filter(&NoPrivateBlocks, req).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn new_filter_auto_allocates_decreasing_priorities() {
        let (plane, _ns) = plane_with_block(2);
        plane.registry.register(StubOps::new("s1-autoprio", ActionCode::Ok)).unwrap();

        let first = new_filter_req("s1-autoprio", 2, 0, 0, 0x0800, 1);
        let prio1 = plane.new_filter(&NoPrivateBlocks, first).unwrap();
        assert_eq!(prio1, crate::config::AUTO_PRIO_SEED);

        let second = new_filter_req("s1-autoprio", 2, 0, 0, 0x0800, 2);
        let prio2 = plane.new_filter(&NoPrivateBlocks, second).unwrap();
        assert_eq!(prio2, crate::config::AUTO_PRIO_SEED - 1);
    }

    #[test]
    fn new_filter_reuses_the_existing_proto_at_the_same_prio_and_protocol() {
        let (plane, _ns) = plane_with_block(3);
        plane.registry.register(StubOps::new("s2-insert-unique", ActionCode::Ok)).unwrap();

        let first = new_filter_req("s2-insert-unique", 3, 0, 500, 0x0800, 1);
        let prio1 = plane.new_filter(&NoPrivateBlocks, first).unwrap();

        let second = new_filter_req("s2-insert-unique", 3, 0, 500, 0x0800, 2);
        let prio2 = plane.new_filter(&NoPrivateBlocks, second).unwrap();

        assert_eq!(prio1, 500);
        assert_eq!(prio2, 500);
    }

    #[test]
    fn new_filter_without_create_on_an_empty_slot_is_not_found() {
        let (plane, _ns) = plane_with_block(4);
        let mut req = new_filter_req("does-not-matter", 4, 0, 100, 0x0800, 1);
        req.flags = Flags::empty();
        let err = plane.new_filter(&NoPrivateBlocks, req).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn del_filter_with_prio_zero_flushes_the_whole_chain() {
        let (plane, _ns) = plane_with_block(5);
        plane.registry.register(StubOps::new("s5-flush", ActionCode::Ok)).unwrap();
        plane.new_filter(&NoPrivateBlocks, new_filter_req("s5-flush", 5, 0, 10, 0x0800, 1)).unwrap();
        plane.new_filter(&NoPrivateBlocks, new_filter_req("s5-flush", 5, 0, 20, 0x0800, 2)).unwrap();

        let block = plane.namespace.lookup(5).unwrap();
        let chain = block.find_chain(0).unwrap();
        assert!(!chain.filter_chain.is_empty());

        let del = DelFilterRequest {
            caller: Caller::admin(),
            block: BlockRef::Index(5),
            chain: 0,
            prio: 0,
            protocol: 0,
            handle: 0,
            kind: None,
        };
        plane.del_filter(&NoPrivateBlocks, del).unwrap();
        assert!(chain.filter_chain.is_empty());
    }

    #[test]
    fn del_filter_on_a_missing_chain_with_prio_zero_is_a_noop() {
        let (plane, _ns) = plane_with_block(6);
        let del = DelFilterRequest {
            caller: Caller::admin(),
            block: BlockRef::Index(6),
            chain: 9,
            prio: 0,
            protocol: 0,
            handle: 0,
            kind: None,
        };
        plane.del_filter(&NoPrivateBlocks, del).unwrap();
    }

    #[test]
    fn get_filter_reports_the_stored_handle() {
        let (plane, _ns) = plane_with_block(8);
        plane.registry.register(StubOps::new("s-getfilter", ActionCode::Ok)).unwrap();
        plane.new_filter(&NoPrivateBlocks, new_filter_req("s-getfilter", 8, 0, 30, 0x0800, 7)).unwrap();

        let req = GetFilterRequest { block: BlockRef::Index(8), chain: 0, prio: 30, protocol: 0x0800, handle: 7 };
        let handle = plane.get_filter(&NoPrivateBlocks, req).unwrap();
        assert_eq!(handle, Some(7));
    }

    #[test]
    fn new_chain_then_del_chain_round_trips_through_the_channel() {
        let (plane, _ns) = plane_with_block(10);
        let req = NewChainRequest {
            chain: ChainRequest { caller: Caller::admin(), block: BlockRef::Index(10), chain: 3, flags: Flags::CREATE },
            template: None,
        };
        plane.new_chain(&NoPrivateBlocks, req).unwrap();

        let summary = plane
            .get_chain(&NoPrivateBlocks, ChainRequest { caller: Caller::admin(), block: BlockRef::Index(10), chain: 3, flags: Flags::empty() })
            .unwrap();
        assert_eq!(summary.index, 3);

        plane
            .del_chain(&NoPrivateBlocks, ChainRequest { caller: Caller::admin(), block: BlockRef::Index(10), chain: 3, flags: Flags::empty() })
            .unwrap();

        let block = plane.namespace.lookup(10).unwrap();
        assert!(block.find_chain(3).is_none(), "the explicit reference must be fully released on delete");
    }

    #[test]
    fn get_chain_on_an_action_only_chain_reports_cannot_find() {
        let (plane, _ns) = plane_with_block(11);
        let block = plane.namespace.lookup(11).unwrap();
        let chain = block.get_or_create_chain(6);
        chain.acquire(true);

        let req = ChainRequest { caller: Caller::admin(), block: BlockRef::Index(11), chain: 6, flags: Flags::empty() };
        let err = plane.get_chain(&NoPrivateBlocks, req).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn new_chain_rejects_a_second_explicit_create_while_visible() {
        let (plane, _ns) = plane_with_block(12);
        let req = || NewChainRequest {
            chain: ChainRequest { caller: Caller::admin(), block: BlockRef::Index(12), chain: 1, flags: Flags::CREATE },
            template: None,
        };
        plane.new_chain(&NoPrivateBlocks, req()).unwrap();
        let err = plane.new_chain(&NoPrivateBlocks, req()).unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    /// §4.3: crossing `refcnt > action_refcnt` down to equality must emit
    /// `chain_deleted` even while the chain survives for actions, wired the
    /// same way `chain_added` is wired from `create_proto`'s `first_ref`.
    #[test]
    fn del_chain_fires_chain_deleted_while_an_action_reference_keeps_the_chain_alive() {
        let namespace = Arc::new(Namespace::new());
        namespace.get_or_create(20);
        let channel = RecordingChannel::new();
        let plane = ControlPlane::new(Arc::clone(&namespace), Arc::new(OffloadBridge::new()), Arc::clone(&channel));

        let block = namespace.lookup(20).unwrap();
        block.get_or_create_chain(4).acquire(true);

        let req = NewChainRequest {
            chain: ChainRequest { caller: Caller::admin(), block: BlockRef::Index(20), chain: 4, flags: Flags::CREATE },
            template: None,
        };
        plane.new_chain(&NoPrivateBlocks, req).unwrap();

        plane
            .del_chain(&NoPrivateBlocks, ChainRequest { caller: Caller::admin(), block: BlockRef::Index(20), chain: 4, flags: Flags::empty() })
            .unwrap();

        assert!(channel.events().contains(&"chain_deleted(20,4)".to_string()));
        assert!(block.find_chain(4).is_some(), "the action reference must keep the chain attached to the block");
    }

    #[test]
    fn dump_filter_paginates_across_calls() {
        let (plane, _ns) = plane_with_block(13);
        plane.registry.register(StubOps::new("s-dump", ActionCode::Ok)).unwrap();
        for (prio, handle) in [(10u32, 1u32), (20, 2), (30, 3)] {
            plane.new_filter(&NoPrivateBlocks, new_filter_req("s-dump", 13, 0, prio, 0x0800, handle)).unwrap();
        }

        let mut cursor = DumpCursor::default();
        let page1 = plane.dump_filter(&NoPrivateBlocks, BlockRef::Index(13), 0, &mut cursor, 2).unwrap();
        assert_eq!(page1.items.len(), 2);
        assert!(!page1.done);

        let page2 = plane.dump_filter(&NoPrivateBlocks, BlockRef::Index(13), 0, &mut cursor, 2).unwrap();
        assert_eq!(page2.items.len(), 1);
        assert!(page2.done);
    }

    #[test]
    fn dump_chain_orders_by_index_and_excludes_action_only_chains() {
        let (plane, _ns) = plane_with_block(14);
        let block = plane.namespace.lookup(14).unwrap();
        for index in [5u32, 1, 3] {
            let chain = block.get_or_create_chain(index);
            chain.acquire(false);
        }
        block.get_or_create_chain(9).acquire(true);

        let mut cursor = DumpCursor::default();
        let page = plane.dump_chain(&NoPrivateBlocks, BlockRef::Index(14), &mut cursor, 10).unwrap();
        let indices: Vec<u32> = page.items.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 3, 5]);
        assert!(page.done);
    }
}
