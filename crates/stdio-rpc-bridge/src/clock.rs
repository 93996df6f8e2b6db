//! The abstract time source the bridge measures uptime and timeouts against.
//!
//! Kept as a trait (rather than calling `Instant::now()` directly from
//! `lifecycle.rs`) purely for test determinism: tests can hand a fixed or
//! stepped clock instead of waiting on wall time.

use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
