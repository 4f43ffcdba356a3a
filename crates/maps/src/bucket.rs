/// A bucket untouched for this long is reclaimed by the reaper.
pub const RATE_BUCKET_IDLE_MS: u64 = 600_000;

/// Per-source token bucket row. Refill arithmetic lives in the classifier;
/// this is only the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBucket {
    pub tokens: u32,
    pub last_update_ms: u64,
}
