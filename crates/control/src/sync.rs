//! The map synchronizer.
//!
//! Owns every control-plane write into the shared maps. Mutations are
//! serialized, an endpoint update is a single insert-or-replace at its key
//! (a packet sees the old policy or the new one, never a gap), and removal
//! touches the maps before the store so a re-create cannot collide with a
//! stale row.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use maps::{
    front_key, BlacklistEntry, ConnState, CounterSnapshot, Endpoint, EndpointEvent, EndpointKind,
    Maps, TableError, CHALLENGE_TTL_MS, RATE_BUCKET_IDLE_MS, TCP_FLOW_TIMEOUT_MS,
    UDP_FLOW_TIMEOUT_MS,
};
use util::time::{epoch_ms, now_ms};

use crate::{PushEvent, Store, StoreError};

/// Reaper cadence.
pub const REAP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{0}")]
    Invalid(String),
    #[error("no such endpoint: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Saturated(#[from] TableError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Operator-supplied shape of a new endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSpec {
    pub kind: EndpointKind,
    pub front_ip: Ipv4Addr,
    pub front_port: u16,
    pub origin_ip: Ipv4Addr,
    pub origin_port: u16,
    pub rate_limit: u32,
    pub burst_limit: u32,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Partial update. The front tuple and the kind are immutable: the tuple is
/// the map key, and moving it would be delete-plus-insert rather than a
/// single-slot replace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointUpdate {
    pub origin_ip: Option<Ipv4Addr>,
    pub origin_port: Option<u16>,
    pub rate_limit: Option<u32>,
    pub burst_limit: Option<u32>,
    pub maintenance: Option<bool>,
    pub active: Option<bool>,
}

pub struct Synchronizer {
    maps: Arc<Maps>,
    store: Arc<Store>,
    events: broadcast::Sender<EndpointEvent>,
    /// Serializes control-plane mutations; the packet path never takes this.
    op_lock: Mutex<()>,
}

impl Synchronizer {
    pub fn new(maps: Arc<Maps>, store: Arc<Store>) -> Synchronizer {
        let (events, _) = broadcast::channel(256);
        Synchronizer { maps, store, events, op_lock: Mutex::new(()) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    pub fn maps(&self) -> &Arc<Maps> {
        &self.maps
    }

    /// Boot-time resync: loads the durable desired state into the maps.
    /// Blacklist expiries are converted from wall-clock onto the packet
    /// path's monotonic clock.
    pub fn resync(&self) -> Result<(), SyncError> {
        let _guard = self.op_lock.lock();
        for endpoint in self.store.endpoints()? {
            self.maps.endpoints.insert(endpoint.front_key(), endpoint)?;
        }
        for (ip, until_epoch) in self.store.blacklist_rows()? {
            let remaining = until_epoch.saturating_sub(epoch_ms());
            if remaining == 0 {
                self.store.delete_blacklist(ip)?;
                continue;
            }
            self.maps
                .blacklist
                .insert(u32::from(ip), BlacklistEntry { blocked_until_ms: now_ms() + remaining })?;
        }
        tracing::info!(
            "resynced {} endpoints and {} blacklist rows",
            self.maps.endpoints.len(),
            self.maps.blacklist.len()
        );
        Ok(())
    }

    pub fn add_endpoint(&self, spec: EndpointSpec) -> Result<Endpoint, SyncError> {
        let _guard = self.op_lock.lock();
        validate_limits(spec.rate_limit, spec.burst_limit)?;

        let key = front_key(u32::from(spec.front_ip), spec.front_port, spec.kind.protocol());
        if self.maps.endpoints.contains(&key) {
            return Err(SyncError::Invalid(format!(
                "front address {}:{}/{} is already protected",
                spec.front_ip,
                spec.front_port,
                spec.kind.protocol()
            )));
        }

        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            kind: spec.kind,
            front_ip: spec.front_ip,
            front_port: spec.front_port,
            origin_ip: spec.origin_ip,
            origin_port: spec.origin_port,
            rate_limit: spec.rate_limit,
            burst_limit: spec.burst_limit,
            maintenance: spec.maintenance,
            active: spec.active,
        };

        self.store.put_endpoint(&endpoint)?;
        if let Err(e) = self.maps.endpoints.insert(key, endpoint.clone()) {
            // Surface the exhaustion and undo the durable write.
            self.store.delete_endpoint(endpoint.id)?;
            return Err(e.into());
        }

        tracing::info!("endpoint {} created at {}:{}", endpoint.id, endpoint.front_ip, endpoint.front_port);
        let _ = self.events.send(EndpointEvent::Added(endpoint.clone()));
        Ok(endpoint)
    }

    pub fn update_endpoint(&self, id: Uuid, update: EndpointUpdate) -> Result<Endpoint, SyncError> {
        let _guard = self.op_lock.lock();
        let mut endpoint = self.store.endpoint(id)?.ok_or(SyncError::NotFound(id))?;

        if let Some(origin_ip) = update.origin_ip {
            endpoint.origin_ip = origin_ip;
        }
        if let Some(origin_port) = update.origin_port {
            endpoint.origin_port = origin_port;
        }
        if let Some(rate_limit) = update.rate_limit {
            endpoint.rate_limit = rate_limit;
        }
        if let Some(burst_limit) = update.burst_limit {
            endpoint.burst_limit = burst_limit;
        }
        if let Some(maintenance) = update.maintenance {
            endpoint.maintenance = maintenance;
        }
        if let Some(active) = update.active {
            endpoint.active = active;
        }
        validate_limits(endpoint.rate_limit, endpoint.burst_limit)?;

        self.store.put_endpoint(&endpoint)?;
        // Single-slot replace at the existing key.
        self.maps.endpoints.insert(endpoint.front_key(), endpoint.clone())?;

        let _ = self.events.send(EndpointEvent::Updated(endpoint.clone()));
        Ok(endpoint)
    }

    /// Removes the endpoint from the maps first, then from the store.
    pub fn remove_endpoint(&self, id: Uuid) -> Result<Endpoint, SyncError> {
        let _guard = self.op_lock.lock();
        let endpoint = self.store.endpoint(id)?.ok_or(SyncError::NotFound(id))?;

        self.maps.endpoints.remove(&endpoint.front_key());
        self.store.delete_endpoint(id)?;

        tracing::info!("endpoint {id} removed");
        let _ = self.events.send(EndpointEvent::Removed(endpoint.clone()));
        Ok(endpoint)
    }

    pub fn add_blacklist(&self, ip: Ipv4Addr, ttl_ms: u64) -> Result<(), SyncError> {
        let _guard = self.op_lock.lock();
        self.maps
            .blacklist
            .insert(u32::from(ip), BlacklistEntry { blocked_until_ms: now_ms() + ttl_ms })?;
        self.store.put_blacklist(ip, epoch_ms() + ttl_ms)?;
        tracing::info!("{ip} blacklisted for {ttl_ms} ms");
        Ok(())
    }

    pub fn remove_blacklist(&self, ip: Ipv4Addr) -> Result<bool, SyncError> {
        let _guard = self.op_lock.lock();
        let present = self.maps.blacklist.remove(&u32::from(ip)).is_some();
        let stored = self.store.delete_blacklist(ip)?;
        Ok(present || stored)
    }

    pub fn read_counters(&self) -> CounterSnapshot {
        self.maps.stats.snapshot()
    }

    /// One reaper sweep: expired blacklist rows, idle conntrack entries
    /// (per-kind timeout), stale challenges and long-idle rate buckets.
    pub fn reap_expired(&self, now_ms: u64) {
        self.maps.blacklist.retain(|_, entry| now_ms < entry.blocked_until_ms);

        let endpoints = &self.maps.endpoints;
        self.maps.conntrack.retain(|_, entry| {
            // Flows of a deleted endpoint go with it.
            let Some(kind) = endpoints.lookup(&entry.endpoint_key).map(|e| e.kind) else {
                return false;
            };
            // Mid-challenge rows live on the challenge clock.
            if entry.state == ConnState::Challenged {
                return now_ms.saturating_sub(entry.last_seen_ms) <= CHALLENGE_TTL_MS;
            }
            let timeout = match kind {
                EndpointKind::Java => TCP_FLOW_TIMEOUT_MS,
                EndpointKind::Bedrock => UDP_FLOW_TIMEOUT_MS,
            };
            now_ms.saturating_sub(entry.last_seen_ms) < timeout
        });

        self.maps
            .udp_challenges
            .retain(|_, entry| now_ms.saturating_sub(entry.issued_ms) <= CHALLENGE_TTL_MS);

        self.maps
            .src_rate
            .retain(|_, bucket| now_ms.saturating_sub(bucket.last_update_ms) < RATE_BUCKET_IDLE_MS);

        // Durable blacklist rows expire on the wall clock.
        let wall = epoch_ms();
        if let Ok(rows) = self.store.blacklist_rows() {
            for (ip, until) in rows {
                if until <= wall {
                    if let Err(e) = self.store.delete_blacklist(ip) {
                        tracing::warn!("unable to reap blacklist row {ip}: {e}");
                    }
                }
            }
        }
    }

    /// Runs the reaper until cancellation, with a final sweep on the way
    /// out.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.reap_expired(now_ms()),
            }
        }
        self.reap_expired(now_ms());
        tracing::debug!("reaper stopped");
    }

    /// Periodically persists a counter snapshot and publishes it on the push
    /// channel.
    pub async fn metrics_loop(
        self: Arc<Self>,
        every: Duration,
        push: broadcast::Sender<PushEvent>,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => (),
            }
            let snapshot = self.read_counters();
            if let Err(e) = self.store.record_metrics(epoch_ms(), &snapshot) {
                tracing::warn!("unable to persist metrics summary: {e}");
            }
            let _ = push.send(PushEvent::MetricsUpdate(snapshot));
        }
    }
}

fn validate_limits(rate_limit: u32, burst_limit: u32) -> Result<(), SyncError> {
    if rate_limit < 1 {
        return Err(SyncError::Invalid(String::from("rate_limit must be at least 1")));
    }
    if burst_limit < rate_limit {
        return Err(SyncError::Invalid(String::from("burst_limit must be >= rate_limit")));
    }
    Ok(())
}
