//! A trimmed copy of `librad::rate_limit`'s `Direct` limiter: this crate
//! only needs one un-keyed rate limit (the reclassify-cap notice of
//! §4.5 step 4), so the `Keyed`/maintenance-thread half of that original
//! module is not carried over.

pub use governor::{clock::Clock, NotUntil, Quota};

type Inner = governor::RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Guards a single log line from being emitted more than the configured
/// [`Quota`] allows, the same technique `librad::rate_limit::RateLimiter`
/// uses to keep a noisy path from flooding the log.
#[derive(Clone)]
pub struct RateLimiter {
    inner: std::sync::Arc<Inner>,
}

impl RateLimiter {
    pub fn direct(quota: Quota) -> Self {
        Self { inner: std::sync::Arc::new(governor::RateLimiter::direct(quota)) }
    }

    pub fn check(&self) -> Result<(), NotUntil<<governor::clock::DefaultClock as Clock>::Instant>> {
        self.inner.check()
    }
}
