//! Control-plane core for a hierarchical packet classifier registry.
//!
//! A [`Namespace`](block::Namespace) owns a table of shared [`Block`]s, each
//! holding a numbered list of [`Chain`]s, each holding a priority-ordered list
//! of [`Proto`] classifier instances. [`control::ControlPlane`] exposes the
//! create/update/delete/get/dump commands over that graph, and
//! [`dispatch::ClassifyDispatcher`] walks it for every packet.
//!
//! Concrete classifier kinds, action execution, qdisc/netdev/namespace
//! plumbing and the wire codec are external collaborators; this crate only
//! consumes them through the narrow interfaces in [`ops`], [`offload`] and
//! [`qdisc`].

#[macro_use]
extern crate lazy_static;

pub mod attrs;
pub mod block;
pub mod chain;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod offload;
pub mod ops;
pub mod packet;
pub mod proto;
pub mod qdisc;
pub mod rate_limit;

pub mod testing;

pub use block::{Block, BinderKind, Namespace};
pub use chain::Chain;
pub use config::Config;
pub use error::Error;
pub use ops::{ClassifierOps, OpsRegistry};
pub use proto::Proto;
