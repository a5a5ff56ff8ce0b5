//! The error taxonomy of §7: one [`thiserror::Error`] enum shared across
//! the lifecycle, prio-list and control-plane modules, following the shape
//! of `link-tracking::git::tracking::error`.

use thiserror::Error;

/// Exit codes surfaced as negative response codes on the control channel.
///
/// `TryAgain` is intercepted by [`crate::control::ControlPlane`]'s replay
/// loop and must never reach a caller outside this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("permission denied")]
    Permission,

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("already exists: {0}")]
    Exists(&'static str),

    #[error("invalid request: {0}")]
    Invalid(&'static str),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("transient failure, caller must replay the command")]
    TryAgain,

    #[error("dump output exceeded buffer, resume with the returned cursor")]
    MessageTooBig,
}

impl Error {
    /// `true` for the one variant that must never escape the replay loop.
    pub fn is_try_again(&self) -> bool {
        matches!(self, Error::TryAgain)
    }
}
