//! §3 Chain and §4.3 Chain lifecycle.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::Block;
use crate::control::ControlChannel;
use crate::error::Error;
use crate::ops::{ClassifierOps, Private};
use crate::proto::PrioList;

/// Mutable fields conceptually guarded by `block.lock` (§3 Chain: "refcnt:
/// u32 (guarded by `block.lock`)"); bundled behind their own mutex because
/// `Chain` lives inside an `Arc` shared with the block's chain list, not
/// behind a `&mut Block`.
struct State {
    refcnt: u32,
    action_refcnt: u32,
    explicitly_created: bool,
    flushing: bool,
    tmplt: Option<Template>,
    /// Set by the control plane once it resolves or creates this chain, so
    /// `release` can fire the "chain deleted" notice (§4.3) from wherever
    /// the last non-action reference happens to drop, the same way
    /// `__tcf_chain_put` fires it inside the refcount decrement itself
    /// rather than at each of its callers.
    channel: Option<Arc<dyn ControlChannel>>,
}

/// A chain-level kind pin (GLOSSARY "Template"): forces every proto created
/// in this chain to share one classifier kind.
pub struct Template {
    pub ops: Arc<dyn ClassifierOps>,
    pub private: Mutex<Private>,
}

/// §3 Chain: a numbered compartment inside a [`Block`] holding one
/// priority-ordered list of protos.
pub struct Chain {
    /// Strong back-reference: keeps the block alive while this chain exists.
    pub block: Arc<Block>,
    pub index: u32,
    pub filter_chain: PrioList,
    state: Mutex<State>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("refcnt", &state.refcnt)
            .field("action_refcnt", &state.action_refcnt)
            .field("flushing", &state.flushing)
            .finish()
    }
}

impl Chain {
    pub(crate) fn new(block: Arc<Block>, index: u32) -> Arc<Self> {
        Arc::new(Self {
            block,
            index,
            filter_chain: PrioList::new(),
            state: Mutex::new(State {
                refcnt: 0,
                action_refcnt: 0,
                explicitly_created: false,
                flushing: false,
                tmplt: None,
                channel: None,
            }),
        })
    }

    /// Install the channel `release` notifies on a visibility-crossing put.
    /// Idempotent: later calls (e.g. a replay re-resolving the same chain)
    /// simply replace the stored handle with an equivalent one.
    pub fn set_channel(&self, channel: Arc<dyn ControlChannel>) {
        self.state.lock().channel = Some(channel);
    }

    pub fn refcnt(&self) -> u32 {
        self.state.lock().refcnt
    }

    pub fn action_refcnt(&self) -> u32 {
        self.state.lock().action_refcnt
    }

    pub fn is_explicitly_created(&self) -> bool {
        self.state.lock().explicitly_created
    }

    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }

    /// §8 property 6, visibility law: a chain with `refcnt == action_refcnt`
    /// is never returned by user-facing enumerate/dump.
    pub fn is_visible(&self) -> bool {
        let state = self.state.lock();
        state.refcnt > state.action_refcnt
    }

    pub fn template(&self) -> Option<Arc<dyn ClassifierOps>> {
        self.state.lock().tmplt.as_ref().map(|t| Arc::clone(&t.ops))
    }

    pub fn set_template(&self, ops: Arc<dyn ClassifierOps>, private: Private) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.tmplt.is_some() {
            return Err(Error::Exists("chain already has a template"));
        }
        state.tmplt = Some(Template { ops, private: Mutex::new(private) });
        Ok(())
    }

    pub fn clear_template(&self) {
        let tmplt = self.state.lock().tmplt.take();
        if let Some(t) = tmplt {
            let mut private = t.private.lock();
            t.ops.tmplt_destroy(&mut private);
        }
    }

    /// §4.3 `get`: increment `refcnt` (and `action_refcnt` if requested).
    /// Returns `true` if this was the first non-action reference, the
    /// signal for the caller to emit a "chain added" notification.
    pub fn acquire(self: &Arc<Self>, by_action: bool) -> bool {
        let mut state = self.state.lock();
        let was_visible = state.refcnt > state.action_refcnt;
        state.refcnt += 1;
        if by_action {
            state.action_refcnt += 1;
        }
        let now_visible = state.refcnt > state.action_refcnt;
        !was_visible && now_visible
    }

    /// Promote an action-only reference to an explicit one (§4.7
    /// NewChain/DelChain/GetChain: "on NEW, if it exists only by
    /// action-ref, promote to explicit by taking an additional
    /// reference").
    pub fn promote_explicit(self: &Arc<Self>) -> bool {
        let first_visible = self.acquire(false);
        self.state.lock().explicitly_created = true;
        first_visible
    }

    pub fn mark_explicitly_created(&self) {
        self.state.lock().explicitly_created = true;
    }

    /// §4.3 `put`: symmetric decrement. Crossing `refcnt > action_refcnt`
    /// down to equality fires a "chain deleted" notification on the
    /// installed channel (see [`Chain::set_channel`]) even though the chain
    /// lives on for actions. Returns whether this was the reference that
    /// brought `refcnt` to zero, the signal to detach the chain from its
    /// block.
    pub fn release(self: &Arc<Self>, by_action: bool) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.refcnt > 0);
        let was_visible = state.refcnt > state.action_refcnt;
        state.refcnt -= 1;
        if by_action {
            debug_assert!(state.action_refcnt > 0);
            state.action_refcnt -= 1;
        }
        let now_visible = state.refcnt > state.action_refcnt;
        let crossed_to_invisible = was_visible && !now_visible;
        let crossed_to_zero = state.refcnt == 0;
        let channel = if crossed_to_invisible { state.channel.clone() } else { None };
        drop(state);

        if let Some(channel) = channel {
            channel.chain_deleted(self.block.index, self.index);
        }
        if crossed_to_zero {
            self.block.detach_chain(self);
        }
        crossed_to_zero
    }

    /// §4.3 `flush`: atomically swap `filter_chain` to empty, mark
    /// `flushing`, notify chain-0 observers, then drop the returned protos
    /// (the caller drops the `Arc`s, releasing the strong references the
    /// list held).
    pub fn flush(&self) -> Vec<Arc<crate::proto::Proto>> {
        self.state.lock().flushing = true;
        let removed = self.filter_chain.take_all();
        if self.index == 0 {
            self.block.notify_chain0(None);
        }
        removed
    }

    pub fn end_flush(&self) {
        self.state.lock().flushing = false;
    }

    /// §4.4 Remove(proto), plus the chain-0 head-change notification that
    /// removal implies (§4.4: "if `proto` was the head and `chain.index ==
    /// 0`, notifies observers with the new head").
    pub fn remove_proto(&self, proto: &Arc<crate::proto::Proto>) {
        let was_head = self.filter_chain.remove(proto);
        if was_head && self.index == 0 {
            self.block.notify_chain0(self.filter_chain.head());
        }
    }

    /// §4.4 Delete-if-empty(proto), plus the chain-0 notification implied
    /// by removing the head.
    pub fn delete_proto_if_empty(&self, proto: &Arc<crate::proto::Proto>) -> bool {
        let was_head = self
            .filter_chain
            .head()
            .map_or(false, |h| Arc::ptr_eq(&h, proto));
        let removed = self.filter_chain.delete_if_empty(proto);
        if removed && was_head && self.index == 0 {
            self.block.notify_chain0(self.filter_chain.head());
        }
        removed
    }

    /// Instantiate a new proto via `ops.init` and bind it to this chain,
    /// taking the one chain reference the proto holds for its whole
    /// lifetime (released in `Proto::drop`) — the Rust equivalent of the
    /// original's one-shot `tcf_chain_get`-then-transfer dance around
    /// `tcf_proto_create` (see `cls_api.c`'s `tc_new_tfilter`). Returns
    /// whether this was the chain's first non-action reference, the
    /// signal for a "chain added" notification.
    pub fn create_proto(
        self: &Arc<Self>,
        kind: String,
        ops: Arc<dyn ClassifierOps>,
        prio: u32,
        protocol: u32,
    ) -> Result<(Arc<crate::proto::Proto>, bool), Error> {
        let first_ref = self.acquire(false);
        match crate::proto::Proto::new(kind, ops, prio, protocol, Arc::clone(self)) {
            Ok(proto) => Ok((proto, first_ref)),
            Err(e) => {
                self.release(false);
                Err(e)
            },
        }
    }

    /// **Insert-unique** (§4.4), plus the chain-0 notification implied by a
    /// new head (insertion at head of chain 0).
    pub fn insert_proto(&self, proto: Arc<crate::proto::Proto>) -> Result<Arc<crate::proto::Proto>, Error> {
        let was_head_before = self.filter_chain.head();
        let result = self.filter_chain.insert_unique(proto, || self.is_flushing())?;
        if self.index == 0 {
            let head_after = self.filter_chain.head();
            let changed = match (&was_head_before, &head_after) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, Some(_)) => true,
                _ => false,
            };
            if changed {
                self.block.notify_chain0(head_after);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::block::Chain0Observer;
    use crate::packet::ActionCode;
    use crate::proto::Proto;
    use crate::testing::{RecordingChannel, StubOps};

    #[derive(Default)]
    struct RecordingObserver {
        heads: Mutex<Vec<Option<u32>>>,
    }

    impl Chain0Observer for RecordingObserver {
        fn head_changed(&self, head: Option<Arc<Proto>>) {
            self.heads.lock().unwrap().push(head.map(|p| p.prio));
        }
    }

    #[test]
    fn refcount_balance_returns_to_zero_after_create_get_put() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        assert_eq!(chain.refcnt(), 0);

        let (p, first) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 10, 0x0800).unwrap();
        assert!(first);
        assert_eq!(chain.refcnt(), 1);

        let extra = chain.acquire(false);
        assert!(!extra, "second reference is not the first");
        assert_eq!(chain.refcnt(), 2);
        chain.release(false);
        assert_eq!(chain.refcnt(), 1);

        drop(p);
        assert_eq!(chain.refcnt(), 0);
    }

    #[test]
    fn visibility_law_hides_action_only_chains() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(3);
        chain.acquire(true);
        chain.acquire(true);
        assert_eq!(chain.refcnt(), 2);
        assert_eq!(chain.action_refcnt(), 2);
        assert!(!chain.is_visible(), "a chain held only by actions must not be visible");

        chain.acquire(false);
        assert!(chain.is_visible());
    }

    #[test]
    fn chain_zero_notifies_observers_on_each_distinct_head() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(0);
        let observer = Arc::new(RecordingObserver::default());
        block.add_chain0_observer(observer.clone());

        let (p1, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 200, 0x0800).unwrap();
        chain.insert_proto(p1).unwrap();
        let (p2, _) = chain.create_proto("stub".into(), StubOps::new("stub", ActionCode::Ok), 100, 0x0800).unwrap();
        chain.insert_proto(p2).unwrap();

        chain.flush();

        let heads = observer.heads.lock().unwrap().clone();
        assert_eq!(heads, vec![Some(200), Some(100), None]);
    }

    /// §4.3: crossing `refcnt > action_refcnt` down to equality fires
    /// `chain_deleted` on the installed channel, even though the chain
    /// keeps living for its remaining action reference.
    #[test]
    fn release_fires_chain_deleted_on_the_visibility_crossing_put() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(2);
        let channel = RecordingChannel::new();
        chain.set_channel(channel.clone());

        chain.acquire(true);
        chain.acquire(false);
        assert!(channel.events().is_empty(), "acquire never fires chain_deleted");

        chain.release(false);
        assert_eq!(channel.events(), vec!["chain_deleted(0,2)".to_string()]);
        assert!(!chain.is_visible());
        assert_eq!(chain.refcnt(), 1, "the action reference keeps the chain alive");
    }

    #[test]
    fn put_detaches_chain_from_block_at_zero_refcount() {
        let block = crate::block::new_private();
        let chain = block.get_or_create_chain(7);
        chain.acquire(false);
        assert_eq!(block.chain_count(), 1);
        chain.release(false);
        assert_eq!(block.chain_count(), 0);
    }
}
