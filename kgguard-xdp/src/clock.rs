//! Monotonic nanosecond clock for live runs. Tests and replays pass explicit
//! timestamps instead.

use std::sync::OnceLock;
use std::time::Instant;

static BOOT: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process.
pub fn monotonic_ns() -> u64 {
    let boot = BOOT.get_or_init(Instant::now);
    u64::try_from(boot.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_goes_backwards() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
