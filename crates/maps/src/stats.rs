use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Slots of the counter array. Only the classifier writes these; readers get
/// monotonic approximations, not transactional snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    TotalPackets = 0,
    Allowed,
    DroppedRatelimit,
    DroppedBlacklist,
    DroppedBadproto,
    DroppedChallenge,
    DroppedMaintenance,
    Pass,
    Redirect,
    ChallengesSent,
    ChallengesPassed,
    Saturation,
}

const COUNTER_SLOTS: usize = 12;

/// Fixed array of monotonic 64-bit counters (`map_stats`).
#[derive(Debug, Default)]
pub struct StatsMap {
    slots: [AtomicU64; COUNTER_SLOTS],
}

impl StatsMap {
    pub fn new() -> StatsMap {
        StatsMap::default()
    }

    #[inline]
    pub fn bump(&self, counter: Counter) {
        self.slots[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, counter: Counter) -> u64 {
        self.slots[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_packets: self.get(Counter::TotalPackets),
            allowed: self.get(Counter::Allowed),
            dropped_ratelimit: self.get(Counter::DroppedRatelimit),
            dropped_blacklist: self.get(Counter::DroppedBlacklist),
            dropped_badproto: self.get(Counter::DroppedBadproto),
            dropped_challenge: self.get(Counter::DroppedChallenge),
            dropped_maintenance: self.get(Counter::DroppedMaintenance),
            pass: self.get(Counter::Pass),
            redirect: self.get(Counter::Redirect),
            challenges_sent: self.get(Counter::ChallengesSent),
            challenges_passed: self.get(Counter::ChallengesPassed),
            saturation: self.get(Counter::Saturation),
        }
    }
}

/// Point-in-time copy of the counter array, as served by the API and stored
/// in the metrics history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub total_packets: u64,
    pub allowed: u64,
    pub dropped_ratelimit: u64,
    pub dropped_blacklist: u64,
    pub dropped_badproto: u64,
    pub dropped_challenge: u64,
    pub dropped_maintenance: u64,
    pub pass: u64,
    pub redirect: u64,
    pub challenges_sent: u64,
    pub challenges_passed: u64,
    pub saturation: u64,
}

impl CounterSnapshot {
    /// Sum of every per-packet outcome except `pass`. Equals
    /// `total_packets - pass` whenever the counters are quiescent.
    pub fn accounted(&self) -> u64 {
        self.allowed
            + self.dropped_ratelimit
            + self.dropped_blacklist
            + self.dropped_badproto
            + self.dropped_challenge
            + self.dropped_maintenance
            + self.saturation
    }
}
