use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use util::time::now_ms;

/// Accounting record for one relayed flow. Owned by its copier tasks and
/// released on the last exit path.
#[derive(Debug)]
pub struct FlowRecord {
    pub id: u64,
    pub endpoint_id: Uuid,
    pub client: SocketAddr,
    /// Origin-side address, recorded once the dial completes.
    server: RwLock<Option<SocketAddr>>,
    pub started: Instant,
    last_seen_ms: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl FlowRecord {
    fn new(id: u64, endpoint_id: Uuid, client: SocketAddr) -> FlowRecord {
        FlowRecord {
            id,
            endpoint_id,
            client,
            server: RwLock::new(None),
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(now_ms()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn set_server(&self, addr: SocketAddr) {
        *self.server.write() = Some(addr);
    }

    pub fn server(&self) -> Option<SocketAddr> {
        *self.server.read()
    }

    /// Marks the flow live. Called on every successful read.
    pub fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_seen_ms.load(Ordering::Relaxed))
    }

    /// Bytes flowing origin -> client.
    pub fn add_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Bytes flowing client -> origin.
    pub fn add_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

/// Live flows across both relays.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: DashMap<u64, Arc<FlowRecord>>,
    next_id: AtomicU64,
}

impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable::default()
    }

    pub fn allocate(&self, endpoint_id: Uuid, client: SocketAddr) -> Arc<FlowRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(FlowRecord::new(id, endpoint_id, client));
        self.flows.insert(id, Arc::clone(&record));
        record
    }

    pub fn release(&self, id: u64) -> Option<Arc<FlowRecord>> {
        self.flows.remove(&id).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
