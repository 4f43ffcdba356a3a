//! Stateless UDP cookie challenge for Bedrock sources.
//!
//! A fresh source is dropped and remembered; a legitimate client retransmits
//! and re-arrives inside the window, which a spoofed source address cannot
//! do. The sub-100 ms guard defeats naive single-shot floods; the 5 s
//! ceiling reclaims state under pressure. The cookie is stored, never sent.

use maps::{ChallengeEntry, Counter, Maps, CHALLENGE_MIN_RTT_MS, CHALLENGE_TTL_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// The source has proven liveness; the record is consumed.
    Pass,
    /// Drop this packet and let the client retry.
    DropPending,
}

/// Deterministic, non-cryptographic XOR-fold of arrival time and source.
pub fn mix_cookie(now_ms: u64, src_ip: u32) -> u32 {
    let spread = now_ms ^ ((src_ip as u64) << 32 | (src_ip as u64).rotate_left(13));
    (spread >> 32) as u32 ^ spread as u32
}

pub fn run_challenge(maps: &Maps, src_ip: u32, now_ms: u64) -> ChallengeOutcome {
    if let Some(entry) = maps.udp_challenges.lookup(&src_ip) {
        let age = now_ms.saturating_sub(entry.issued_ms);
        if age > CHALLENGE_TTL_MS {
            // Stale record, restart the window.
            let fresh = ChallengeEntry { issued_ms: now_ms, cookie: mix_cookie(now_ms, src_ip) };
            let _ = maps.udp_challenges.insert(src_ip, fresh);
            maps.stats.bump(Counter::ChallengesSent);
            return ChallengeOutcome::DropPending;
        }
        if age < CHALLENGE_MIN_RTT_MS {
            return ChallengeOutcome::DropPending;
        }
        maps.udp_challenges.remove(&src_ip);
        maps.stats.bump(Counter::ChallengesPassed);
        return ChallengeOutcome::Pass;
    }

    let fresh = ChallengeEntry { issued_ms: now_ms, cookie: mix_cookie(now_ms, src_ip) };
    match maps.udp_challenges.insert(src_ip, fresh) {
        Ok(_) => maps.stats.bump(Counter::ChallengesSent),
        Err(_) => maps.stats.bump(Counter::Saturation),
    }
    ChallengeOutcome::DropPending
}

#[cfg(test)]
mod test {
    use super::*;

    const SRC: u32 = 0x01020304;

    #[test]
    fn fresh_source_is_challenged() {
        let maps = Maps::new();
        assert_eq!(run_challenge(&maps, SRC, 1_000), ChallengeOutcome::DropPending);
        assert_eq!(maps.stats.get(Counter::ChallengesSent), 1);
        assert!(maps.udp_challenges.contains(&SRC));
    }

    #[test]
    fn retry_inside_window_passes_once() {
        let maps = Maps::new();
        run_challenge(&maps, SRC, 1_000);
        assert_eq!(run_challenge(&maps, SRC, 1_200), ChallengeOutcome::Pass);
        assert_eq!(maps.stats.get(Counter::ChallengesPassed), 1);
        // The record is consumed; the next arrival starts over.
        assert!(!maps.udp_challenges.contains(&SRC));
        assert_eq!(run_challenge(&maps, SRC, 1_300), ChallengeOutcome::DropPending);
    }

    #[test]
    fn retry_below_min_rtt_is_held() {
        let maps = Maps::new();
        run_challenge(&maps, SRC, 1_000);
        assert_eq!(run_challenge(&maps, SRC, 1_050), ChallengeOutcome::DropPending);
        assert_eq!(maps.stats.get(Counter::ChallengesPassed), 0);
        // Exactly at the guard is acceptable.
        assert_eq!(run_challenge(&maps, SRC, 1_100), ChallengeOutcome::Pass);
    }

    #[test]
    fn stale_record_restarts_window() {
        let maps = Maps::new();
        run_challenge(&maps, SRC, 1_000);
        assert_eq!(run_challenge(&maps, SRC, 7_000), ChallengeOutcome::DropPending);
        assert_eq!(maps.stats.get(Counter::ChallengesSent), 2);
        // The restarted window behaves like a fresh one.
        assert_eq!(run_challenge(&maps, SRC, 7_200), ChallengeOutcome::Pass);
    }

    #[test]
    fn boundary_at_ttl_still_passes() {
        let maps = Maps::new();
        run_challenge(&maps, SRC, 1_000);
        assert_eq!(run_challenge(&maps, SRC, 6_000), ChallengeOutcome::Pass);
    }

    #[test]
    fn cookie_mix_depends_on_inputs() {
        assert_ne!(mix_cookie(1_000, 1), mix_cookie(1_000, 2));
        assert_ne!(mix_cookie(1_000, 1), mix_cookie(2_000, 1));
        assert_eq!(mix_cookie(1_000, 1), mix_cookie(1_000, 1));
    }
}
