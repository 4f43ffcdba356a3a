//! The verdict pipeline.
//!
//! Order per packet: parse, blacklist, endpoint lookup, maintenance, token
//! bucket, conntrack bypass, kind validation (with the cookie challenge on
//! the Bedrock path), conntrack update, redirect.

use maps::{
    front_key, ConnState, ConntrackEntry, Counter, EndpointKind, FlowKey, Maps, Protocol,
    RateBucket,
};

use crate::challenge::{run_challenge, ChallengeOutcome};
use crate::packet::{parse_frame, PacketView, Parsed};
use crate::{bedrock, java};

/// The three possible outcomes for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Free the buffer.
    Drop,
    /// Hand the packet to the host network stack.
    Pass,
    /// Hand the packet to the user-space relay.
    Redirect,
}

/// Classifies one raw Ethernet frame.
pub fn classify(maps: &Maps, now_ms: u64, frame: &[u8]) -> Verdict {
    match parse_frame(frame) {
        Parsed::Flow(pkt) => classify_flow(maps, now_ms, &pkt),
        Parsed::Ignored => Verdict::Pass,
        Parsed::Malformed => Verdict::Drop,
    }
}

/// Classifies an already-extracted flow view. The relay front door calls
/// this directly with tuples taken from its sockets.
pub fn classify_flow(maps: &Maps, now_ms: u64, pkt: &PacketView<'_>) -> Verdict {
    maps.stats.bump(Counter::TotalPackets);

    // Blacklist, deleting expired rows lazily.
    if let Some(entry) = maps.blacklist.lookup(&pkt.src_ip) {
        if now_ms < entry.blocked_until_ms {
            maps.stats.bump(Counter::DroppedBlacklist);
            return Verdict::Drop;
        }
        maps.blacklist.remove(&pkt.src_ip);
    }

    let endpoint_key = front_key(pkt.dst_ip, pkt.dst_port, pkt.protocol);
    let Some(endpoint) = maps.endpoints.lookup(&endpoint_key) else {
        // A front protected over the other L4 is a kind mismatch, not
        // unprotected traffic.
        let alternate = match pkt.protocol {
            Protocol::Tcp => Protocol::Udp,
            Protocol::Udp => Protocol::Tcp,
        };
        if maps.endpoints.contains(&front_key(pkt.dst_ip, pkt.dst_port, alternate)) {
            maps.stats.bump(Counter::DroppedBadproto);
            return Verdict::Drop;
        }
        maps.stats.bump(Counter::Pass);
        return Verdict::Pass;
    };

    if !endpoint.active {
        maps.stats.bump(Counter::Pass);
        return Verdict::Pass;
    }

    if endpoint.maintenance {
        maps.stats.bump(Counter::DroppedMaintenance);
        return Verdict::Drop;
    }

    // Token bucket: load-or-init full, refill by elapsed time, spend one.
    let bucket = maps.src_rate.load_or_insert_with(pkt.src_ip, || RateBucket {
        tokens: endpoint.burst_limit,
        last_update_ms: now_ms,
    });
    match bucket {
        Ok(mut bucket) => {
            let elapsed = now_ms.saturating_sub(bucket.last_update_ms);
            let refill = elapsed
                .saturating_mul(endpoint.rate_limit as u64)
                .checked_div(1000)
                .unwrap_or(0)
                .min(endpoint.burst_limit as u64) as u32;
            bucket.tokens = bucket.tokens.saturating_add(refill).min(endpoint.burst_limit);
            bucket.last_update_ms = now_ms;
            if bucket.tokens == 0 {
                drop(bucket);
                maps.stats.bump(Counter::DroppedRatelimit);
                return Verdict::Drop;
            }
            bucket.tokens -= 1;
        }
        Err(_) => {
            maps.stats.bump(Counter::Saturation);
            return Verdict::Drop;
        }
    }

    // An established flow has already proven itself; skip re-validation.
    let flow_hash = FlowKey {
        src_ip: pkt.src_ip,
        dst_ip: pkt.dst_ip,
        src_port: pkt.src_port,
        dst_port: pkt.dst_port,
        protocol: pkt.protocol,
    }
    .hash();
    if let Some(mut entry) = maps.conntrack.get_mut(&flow_hash) {
        if entry.state == ConnState::Established {
            entry.last_seen_ms = now_ms;
            drop(entry);
            maps.stats.bump(Counter::Allowed);
            maps.stats.bump(Counter::Redirect);
            return Verdict::Redirect;
        }
    }

    // The lookup key pins the L4, so the packet's protocol always agrees
    // with the endpoint kind from here on.
    let validated = match endpoint.kind {
        EndpointKind::Java => {
            if pkt.payload.is_empty() {
                // Bare control segment: admissible, proves nothing yet.
                false
            } else if java::is_valid_handshake(pkt.payload) {
                true
            } else {
                maps.stats.bump(Counter::DroppedBadproto);
                return Verdict::Drop;
            }
        }
        EndpointKind::Bedrock => {
            if !bedrock::is_valid_raknet(pkt.payload) {
                maps.stats.bump(Counter::DroppedBadproto);
                return Verdict::Drop;
            }
            match run_challenge(maps, pkt.src_ip, now_ms) {
                ChallengeOutcome::Pass => true,
                ChallengeOutcome::DropPending => {
                    // Record the attempt; a challenged entry grants no bypass.
                    if let Ok(mut entry) = maps.conntrack.load_or_insert_with(flow_hash, || {
                        ConntrackEntry {
                            endpoint_key,
                            state: ConnState::Challenged,
                            created_ms: now_ms,
                            last_seen_ms: now_ms,
                        }
                    }) {
                        entry.last_seen_ms = now_ms;
                    }
                    maps.stats.bump(Counter::DroppedChallenge);
                    return Verdict::Drop;
                }
            }
        }
    };

    // Conntrack update: first writer wins, promotions only.
    let entry = maps.conntrack.load_or_insert_with(flow_hash, || ConntrackEntry {
        endpoint_key,
        state: if validated { ConnState::Established } else { ConnState::New },
        created_ms: now_ms,
        last_seen_ms: now_ms,
    });
    match entry {
        Ok(mut entry) => {
            entry.last_seen_ms = now_ms;
            if validated {
                entry.state = ConnState::Established;
            }
        }
        Err(_) => {
            maps.stats.bump(Counter::Saturation);
            return Verdict::Drop;
        }
    }

    maps.stats.bump(Counter::Allowed);
    maps.stats.bump(Counter::Redirect);
    Verdict::Redirect
}
