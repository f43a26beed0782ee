//! Clock abstraction so rate-limit windows can be tested without sleeping.
//!
//! - `SystemClock`: delegates to `tokio::time::Instant`
//! - `MockClock`: returns a controllable instant (tests only)

use tokio::time::Instant;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
pub use mock::MockClock;
