//! Runtime-tunable constants, following the shape of
//! `librad::net::protocol::state::StateConfig`: a small `Copy` struct so
//! tests can shrink the numbers the crate otherwise fixes as literals.

use std::num::NonZeroU32;

use governor::Quota;
use nonzero_ext::nonzero;

/// `0xC0000000`, the seed priority for auto-allocation on an empty chain
/// (§3 PrioList invariants).
pub const AUTO_PRIO_SEED: u32 = 0xC000_0000;

/// Hard cap on reclassify restarts before a packet is shot (§4.5 step 4).
pub const DEFAULT_MAX_RECLASSIFY_LOOP: u32 = 4;

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Number of `Reclassify` restarts tolerated before returning `Shot`.
    pub max_reclassify_loop: u32,
    /// Seed priority used when a chain has no protos and `prio == 0` is
    /// requested.
    pub auto_prio_seed: u32,
    /// Quota for the rate-limited reclassify-cap notice (§4.5 step 4).
    pub reclassify_notice_quota: Quota,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_reclassify_loop: DEFAULT_MAX_RECLASSIFY_LOOP,
            auto_prio_seed: AUTO_PRIO_SEED,
            reclassify_notice_quota: Quota::per_second(nonzero!(1u32)),
        }
    }
}
