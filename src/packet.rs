//! Packet-path types for [`crate::dispatch::ClassifyDispatcher`] (§4.5).

/// Wire protocol family, or the `ALL` sentinel a proto can use to match any
/// protocol (§3 Proto).
pub const PROTOCOL_ALL: u32 = 0;

/// Minimal packet view the dispatcher needs: its protocol family and the
/// persisted chain-hint side-band (§4.5 step 1, GLOSSARY "Chain-hint").
/// Concrete packet/skb representation is out of scope (§1).
#[derive(Clone, Debug, Default)]
pub struct Packet {
    pub protocol: u32,
    /// Last `GotoChain` target recorded for this packet, consulted on the
    /// next ingress pass.
    pub chain_hint: Option<u32>,
}

impl Packet {
    pub fn new(protocol: u32) -> Self {
        Self { protocol, chain_hint: None }
    }
}

/// Outcome of a single `ops.classify` call or of a full dispatcher walk
/// (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionCode {
    /// Continue upstream lookup; nothing in this chain matched.
    Unspec,
    Ok,
    Shot,
    Stolen,
    Queued,
    /// Ask the dispatcher to restart the walk at its original head.
    Repeat,
    Reclassify,
    /// Redirect to another chain; `ClassifyResult::goto_index`/`goto_tp`
    /// carry the target.
    GotoChain,
    Trap,
}

/// Side-channel the dispatcher and `ops.classify` use to communicate a
/// goto-chain redirect (§4.5 steps 3 and 5).
#[derive(Clone, Debug, Default)]
pub struct ClassifyResult {
    pub goto_index: Option<u32>,
}
