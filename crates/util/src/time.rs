//! Process-wide clocks.
//!
//! The packet path compares timestamps it produced itself, so it runs on a
//! monotonic millisecond clock anchored at the first call. Wall-clock time is
//! only used for durable records that must survive a restart.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the process clock anchor. Monotonic, never wraps in
/// practice (u64 milliseconds outlive any deployment).
pub fn now_ms() -> u64 {
    ANCHOR.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
