//! The queueing discipline subsystem, network-namespace plumbing and device
//! registry are external collaborators (§1): this crate only needs a narrow
//! handle to name "the qdisc that attached this block" and "the netdev an
//! indirect offload callback is keyed on".

/// How a block is attached to its qdisc (GLOSSARY "Binder kind").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinderKind {
    Ingress,
    Egress,
    ClassfulIngress,
}

/// Opaque identity of a qdisc instance. Real qdisc state (scheduling,
/// queues, ...) is out of scope; only identity and equality matter to the
/// block/owner bookkeeping in §4.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QdiscHandle(pub u64);

/// Whether a qdisc's classifier ops advertise lock-free dispatch (§4.7
/// prologue step 4: "does not advertise UNLOCKED").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QdiscCaps {
    pub unlocked: bool,
}

/// Opaque identity of a network device, used to key indirect offload
/// bindings (§4.6 Indirect binding) and as the ingress-block lookup key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetdevHandle(pub u64);

/// Whether a netdev's offload path supports binding at all, and whether a
/// `can_offload` failure should be tolerated or treated as fatal (§4.6
/// Direct binding).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetdevCaps {
    pub supports_offload: bool,
    pub can_offload: bool,
}
