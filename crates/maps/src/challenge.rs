/// Oldest a challenge record may be and still count.
pub const CHALLENGE_TTL_MS: u64 = 5_000;
/// Youngest a record may be: a genuine retransmit needs at least one round
/// trip.
pub const CHALLENGE_MIN_RTT_MS: u64 = 100;

/// Pending cookie challenge for a Bedrock source.
///
/// The cookie is computed and stored but never echoed to the client; the
/// challenge is passed by the source re-arriving inside the window, which a
/// spoofed address cannot do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeEntry {
    pub issued_ms: u64,
    pub cookie: u32,
}
