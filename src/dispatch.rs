//! §4.5 ClassifyDispatcher: per-packet traversal with reclassify/goto/shot
//! semantics. The read path takes no locks and does not allocate — it only
//! loads [`crate::proto::PrioList`] snapshots (§5 "Read-side").

use std::sync::Arc;

use governor::Quota;

use crate::block::Block;
use crate::config::Config;
use crate::packet::{ActionCode, ClassifyResult, Packet};
use crate::proto::Proto;
use crate::rate_limit::RateLimiter;

/// Walks a chain's filter list for one packet (§4.5).
///
/// One dispatcher per classify call is cheap: the only state it owns is the
/// rate limiter guarding the reclassify-cap notice, which callers should
/// share across packets (construct once, reuse via `&ClassifyDispatcher`).
pub struct ClassifyDispatcher {
    config: Config,
    reclassify_notice: RateLimiter,
}

impl ClassifyDispatcher {
    pub fn new(config: Config) -> Self {
        let quota = config.reclassify_notice_quota;
        Self { config, reclassify_notice: RateLimiter::direct(quota) }
    }

    pub fn with_default_config() -> Self {
        Self::new(Config::default())
    }

    pub fn quota(&self) -> Quota {
        self.config.reclassify_notice_quota
    }

    /// `classify(packet, start_proto, out_result, compat_mode)` (§4.5).
    ///
    /// `ingress_block` resolves the chain-hint side-band (step 1): it is the
    /// block owning chain 0 for this packet's ingress point. Passing `None`
    /// (no block context available) simply falls through to `start`, as
    /// the dispatcher falls through on miss.
    #[tracing::instrument(level = "trace", skip_all, fields(block = ingress_block.map(|b| b.index)))]
    pub fn classify(
        &self,
        packet: &mut Packet,
        ingress_block: Option<&Arc<Block>>,
        start: Arc<Proto>,
        compat_mode: bool,
    ) -> ActionCode {
        let entry = self
            .resolve_chain_hint(packet, ingress_block)
            .unwrap_or_else(|| Arc::clone(&start));

        let mut tp = entry;
        let mut restarts = 0u32;
        let mut result = ClassifyResult::default();

        loop {
            match self.walk_once(packet, &tp, compat_mode, &mut result) {
                WalkOutcome::Terminal(code) => return code,
                WalkOutcome::Reclassify => {
                    if compat_mode {
                        return ActionCode::Shot;
                    }
                    restarts += 1;
                    if restarts > self.config.max_reclassify_loop {
                        self.notice_reclassify_cap_exceeded(ingress_block, &start);
                        return ActionCode::Shot;
                    }
                    tp = Arc::clone(&start);
                    continue;
                },
                WalkOutcome::GotoChain(index, next) => {
                    packet.chain_hint = Some(index);
                    tp = next;
                    continue;
                },
            }
        }
    }

    fn resolve_chain_hint(&self, packet: &Packet, ingress_block: Option<&Arc<Block>>) -> Option<Arc<Proto>> {
        let hint = packet.chain_hint?;
        let block = ingress_block?;
        let chain = block.find_chain(hint)?;
        chain.filter_chain.head()
    }

    /// Walk from `tp` to the end of the list, invoking `ops.classify` on
    /// each proto whose protocol matches (§4.5 steps 2-3), returning an
    /// outcome for the caller's restart loop (steps 4-7).
    fn walk_once(
        &self,
        packet: &Packet,
        tp: &Arc<Proto>,
        compat_mode: bool,
        result: &mut ClassifyResult,
    ) -> WalkOutcome {
        let chain = Arc::clone(&tp.chain);
        let mut cursor = Some(Arc::clone(tp));

        while let Some(proto) = cursor {
            if proto.protocol != crate::packet::PROTOCOL_ALL && proto.protocol != packet.protocol {
                cursor = next_in_chain(&chain, &proto);
                continue;
            }

            let code = proto.classify(packet, result);
            match code {
                ActionCode::Unspec => {
                    cursor = next_in_chain(&chain, &proto);
                    continue;
                },
                ActionCode::Reclassify if !compat_mode => return WalkOutcome::Reclassify,
                ActionCode::GotoChain => {
                    let index = result.goto_index.unwrap_or(proto.chain.index);
                    if let Some(next_head) = chain.block.find_chain(index).and_then(|c| c.filter_chain.head()) {
                        return WalkOutcome::GotoChain(index, next_head);
                    }
                    // target chain has no protos: fall through as Unspec.
                    cursor = next_in_chain(&chain, &proto);
                    continue;
                },
                other => return WalkOutcome::Terminal(other),
            }
        }

        WalkOutcome::Terminal(ActionCode::Unspec)
    }

    fn notice_reclassify_cap_exceeded(&self, ingress_block: Option<&Arc<Block>>, tp: &Arc<Proto>) {
        if self.reclassify_notice.check().is_ok() {
            tracing::warn!(
                block_index = ingress_block.map(|b| b.index).unwrap_or_default(),
                prio = tp.prio,
                protocol = tp.protocol,
                "reclassify loop exceeded cap, shooting packet",
            );
        }
    }
}

enum WalkOutcome {
    Terminal(ActionCode),
    Reclassify,
    GotoChain(u32, Arc<Proto>),
}

/// The next proto in priority order after `proto`, within `proto`'s own
/// chain (§4.5 step 2 "walk the list from `tp`").
fn next_in_chain(chain: &crate::chain::Chain, proto: &Arc<Proto>) -> Option<Arc<Proto>> {
    let snapshot = chain.filter_chain.snapshot();
    let idx = snapshot.iter().position(|p| Arc::ptr_eq(p, proto))?;
    snapshot.get(idx + 1).cloned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::ClassifierOps;
    use crate::testing::StubOps;

    fn insert(chain: &crate::chain::Chain, ops: Arc<dyn ClassifierOps>, prio: u32, protocol: u32) -> Arc<Proto> {
        let (p, _) = chain.create_proto("stub".into(), ops, prio, protocol).unwrap();
        chain.insert_proto(p).unwrap()
    }

    #[test]
    fn classify_terminates_at_reclassify_cap_with_shot() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let start = insert(&chain, StubOps::new("stub", ActionCode::Reclassify), 10, 0x0800);

        let dispatcher = ClassifyDispatcher::with_default_config();
        let mut packet = Packet::new(0x0800);
        let outcome = dispatcher.classify(&mut packet, None, start, false);
        assert_eq!(outcome, ActionCode::Shot);
    }

    #[test]
    fn classify_shoots_immediately_on_reclassify_in_compat_mode() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let start = insert(&chain, StubOps::new("stub", ActionCode::Reclassify), 10, 0x0800);

        let dispatcher = ClassifyDispatcher::with_default_config();
        let mut packet = Packet::new(0x0800);
        let outcome = dispatcher.classify(&mut packet, None, start, true);
        assert_eq!(outcome, ActionCode::Shot);
    }

    #[test]
    fn goto_chain_jumps_to_the_target_chains_head() {
        let block = crate::block::new_private();
        let source = block.get_or_create_chain(0);
        let target = block.get_or_create_chain(5);
        insert(&target, StubOps::new("stub", ActionCode::Trap), 1, 0x0800);
        let start = insert(&source, StubOps::goto("stub", 5), 10, 0x0800);

        let dispatcher = ClassifyDispatcher::with_default_config();
        let mut packet = Packet::new(0x0800);
        let outcome = dispatcher.classify(&mut packet, None, start, false);
        assert_eq!(outcome, ActionCode::Trap);
        assert_eq!(packet.chain_hint, Some(5));
    }

    #[test]
    fn goto_chain_falls_through_when_target_chain_is_empty() {
        let block = crate::block::new_private();
        let source = block.get_or_create_chain(0);
        block.get_or_create_chain(5);
        let start = insert(&source, StubOps::goto("stub", 5), 10, 0x0800);
        insert(&source, StubOps::new("stub", ActionCode::Ok), 20, 0x0800);

        let dispatcher = ClassifyDispatcher::with_default_config();
        let mut packet = Packet::new(0x0800);
        let outcome = dispatcher.classify(&mut packet, None, start, false);
        assert_eq!(outcome, ActionCode::Ok);
    }

    #[test]
    fn protocol_mismatch_skips_to_the_next_proto() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let start = insert(&chain, StubOps::new("stub", ActionCode::Ok), 10, 0x86dd);
        insert(&chain, StubOps::new("stub", ActionCode::Trap), 20, 0x0800);

        let dispatcher = ClassifyDispatcher::with_default_config();
        let mut packet = Packet::new(0x0800);
        let outcome = dispatcher.classify(&mut packet, None, start, false);
        assert_eq!(outcome, ActionCode::Trap);
    }

    #[test]
    fn chain_hint_resolves_entry_via_ingress_block() {
        let block = crate::block::new_private();
        let hinted = block.get_or_create_chain(7);
        insert(&hinted, StubOps::new("stub", ActionCode::Stolen), 1, 0x0800);
        let unrelated = block.get_or_create_chain(0);
        let start = insert(&unrelated, StubOps::new("stub", ActionCode::Trap), 1, 0x0800);

        let dispatcher = ClassifyDispatcher::with_default_config();
        let mut packet = Packet::new(0x0800);
        packet.chain_hint = Some(7);
        let outcome = dispatcher.classify(&mut packet, Some(&block), start, false);
        assert_eq!(outcome, ActionCode::Stolen);
    }

    /// §4.5 step 6: `Repeat` is not one of the restart codes (`Reclassify`,
    /// `GotoChain`) and must be returned to the caller like any other
    /// non-negative result, the same way `tcf_classify` simply propagates
    /// `TC_ACT_REPEAT` upward in `cls_api.c`. A classifier that always
    /// returns `Repeat` must not hang the dispatcher.
    #[test]
    fn repeat_is_returned_to_the_caller_and_does_not_restart_the_walk() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let start = insert(&chain, StubOps::new("stub", ActionCode::Repeat), 10, 0x0800);

        let dispatcher = ClassifyDispatcher::with_default_config();
        let mut packet = Packet::new(0x0800);
        let outcome = dispatcher.classify(&mut packet, None, start, false);
        assert_eq!(outcome, ActionCode::Repeat);
    }
}
