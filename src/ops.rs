//! §4.1 OpsRegistry: a process-wide `kind -> ops` table.
//!
//! Modeled the way `librad::git::transport` keeps its process-wide
//! `FACTORIES` map: a `lazy_static!` `Arc<RwLock<HashMap<..>>>`, because the
//! registry really is meant to be shared across every [`crate::Namespace`]
//! in the process, just as `libgit2`'s custom-transport table is.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::attrs::AttributeTable;
use crate::error::Error;
use crate::offload::OffloadCallback;
use crate::packet::{ActionCode, ClassifyResult, Packet};

/// Per-proto opaque payload owned by the classifier that created it.
pub type Private = Box<dyn Any + Send + Sync>;

/// The classifier-ops capability (§9 Design Notes): a closed set of
/// operations a concrete classifier kind (u32, fw, flower, ...) exposes to
/// the core. Concrete kinds are out of scope (§1); only this seam is ours.
pub trait ClassifierOps: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Allocate a fresh instance's private payload.
    fn init(&self) -> Result<Private, Error>;

    /// Tear down a private payload. Called once, after the last reference
    /// to the owning [`crate::Proto`] has been dropped.
    fn destroy(&self, private: &mut Private);

    /// Classify `packet` against this instance, writing any goto/redirect
    /// outcome into `result`.
    fn classify(&self, packet: &Packet, private: &Private, result: &mut ClassifyResult)
        -> ActionCode;

    /// Create or update a filter handle inside this instance.
    fn change(
        &self,
        private: &mut Private,
        handle: u32,
        attrs: &AttributeTable,
        replace: bool,
    ) -> Result<(), Error>;

    /// Delete `handle`. Returns `true` if this was the last handle, i.e.
    /// the proto is now empty and eligible for garbage collection.
    fn delete(&self, private: &mut Private, handle: u32) -> Result<bool, Error>;

    fn get(&self, private: &Private, handle: u32) -> Option<u32>;

    /// Visit every live handle. Used by `walker_check_empty` (§4.4
    /// Delete-if-empty).
    fn walk(&self, private: &Private, visit: &mut dyn FnMut(u32) -> bool);

    /// Mirror a single handle to a newly (un)registered offload observer
    /// (§4.6 Playback on late register).
    fn reoffload(&self, private: &Private, add: bool, cb: &dyn OffloadCallback) -> Result<(), Error>;

    fn tmplt_create(&self, attrs: &AttributeTable) -> Result<Private, Error>;
    fn tmplt_destroy(&self, private: &mut Private);
    fn tmplt_dump(&self, private: &Private) -> AttributeTable;
}

impl fmt::Debug for dyn ClassifierOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierOps").field("kind", &self.kind()).finish()
    }
}

/// Outcome of [`OpsRegistry::lookup`] (§4.1).
pub enum Lookup {
    Found(Arc<dyn ClassifierOps>),
    NotFound,
    /// The slow path had to drop the registry's exclusive lock to invoke
    /// the module loader; caller must restart the whole command.
    TryAgain,
}

/// A dynamic classifier-provider loader, consulted on a registry miss.
/// External collaborator (§1): loading/unloading kernel modules is out of
/// scope, we only need its narrow interface.
pub trait ModuleLoader: Send + Sync {
    /// Request that a provider for `kind` be loaded. Returns `true` if a
    /// provider became available (the caller must re-`lookup`, not assume
    /// the ops are ready synchronously).
    fn request_module(&self, kind: &str) -> bool;
}

struct NoopLoader;

impl ModuleLoader for NoopLoader {
    fn request_module(&self, _kind: &str) -> bool {
        false
    }
}

struct Registry {
    table: RwLock<HashMap<String, Arc<dyn ClassifierOps>>>,
    loader: RwLock<Arc<dyn ModuleLoader>>,
}

lazy_static! {
    static ref REGISTRY: Registry = Registry {
        table: RwLock::new(HashMap::new()),
        loader: RwLock::new(Arc::new(NoopLoader)),
    };
}

/// Handle onto the process-wide ops table. Zero-sized: all state lives in
/// the `lazy_static` singleton, mirroring `git::transport::FACTORIES`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpsRegistry;

impl OpsRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Install the module-loader capability used on lookup misses.
    pub fn set_loader(&self, loader: Arc<dyn ModuleLoader>) {
        *REGISTRY.loader.write() = loader;
    }

    /// §4.1 lookup: on hit, the caller receives a cloned `Arc`, which is
    /// already "taking a module reference" in the sense that the provider
    /// cannot be fully unregistered (see [`OpsRegistry::unregister`]) while
    /// any clone is outstanding.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn lookup(&self, kind: &str) -> Lookup {
        if let Some(ops) = REGISTRY.table.read().get(kind) {
            return Lookup::Found(Arc::clone(ops));
        }

        let loader = Arc::clone(&REGISTRY.loader.read());
        tracing::debug!(kind, "ops miss, requesting module load");
        if !loader.request_module(kind) {
            return Lookup::NotFound;
        }

        match REGISTRY.table.read().get(kind) {
            Some(_) => {
                tracing::warn!(kind, "module loaded after dropping the registry lock, replaying");
                Lookup::TryAgain
            },
            None => Lookup::NotFound,
        }
    }

    pub fn register(&self, ops: Arc<dyn ClassifierOps>) -> Result<(), Error> {
        let mut table = REGISTRY.table.write();
        if table.contains_key(ops.kind()) {
            return Err(Error::Exists("classifier kind already registered"));
        }
        table.insert(ops.kind().to_string(), ops);
        Ok(())
    }

    /// §4.1 unregister: in the kernel this waits for in-flight RCU callbacks
    /// from classifier-destroy paths to drain. Every destroy path in this
    /// crate runs synchronously under the owning lock, so there is nothing
    /// to await here beyond dropping the table entry; kept as a distinct
    /// method so the call site documents the intent.
    pub fn unregister(&self, kind: &str) -> Result<(), Error> {
        REGISTRY
            .table
            .write()
            .remove(kind)
            .map(|_| ())
            .ok_or(Error::NotFound("classifier kind"))
    }
}
