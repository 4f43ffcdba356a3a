//! The desired-state store.
//!
//! An embedded key/value database holding the durable records: endpoints,
//! nodes, the global blacklist, per-endpoint whitelists and timestamped
//! counter summaries. Only the synchronizer and the fleet manager touch it.

use std::net::Ipv4Addr;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use maps::{CounterSnapshot, Endpoint};

use crate::NodeRecord;

const ENDPOINTS: TableDefinition<u128, &[u8]> = TableDefinition::new("endpoints");
const NODES: TableDefinition<u128, &[u8]> = TableDefinition::new("nodes");
/// source ip -> wall-clock expiry (ms since epoch)
const BLACKLIST: TableDefinition<u32, u64> = TableDefinition::new("blacklist");
/// (endpoint id, source ip)
const WHITELIST: TableDefinition<(u128, u32), ()> = TableDefinition::new("whitelist");
/// wall-clock timestamp (ms since epoch) -> counter snapshot
const METRICS: TableDefinition<u64, &[u8]> = TableDefinition::new("metrics");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unable to open store: {0}")]
    Open(#[from] redb::DatabaseError),
    #[error("store transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("store table failure: {0}")]
    Table(#[from] redb::TableError),
    #[error("store access failed: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("store commit failed: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("malformed stored record: {0}")]
    Codec(#[from] serde_json::Error),
}

pub struct Store {
    db: Database,
}

impl Store {
    /// Opens (or creates) the store and makes sure every table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Store, StoreError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(ENDPOINTS)?;
            txn.open_table(NODES)?;
            txn.open_table(BLACKLIST)?;
            txn.open_table(WHITELIST)?;
            txn.open_table(METRICS)?;
        }
        txn.commit()?;
        Ok(Store { db })
    }

    // Endpoints

    pub fn put_endpoint(&self, endpoint: &Endpoint) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(endpoint)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENDPOINTS)?;
            table.insert(endpoint.id.as_u128(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENDPOINTS)?;
        match table.get(id.as_u128())? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENDPOINTS)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    pub fn delete_endpoint(&self, id: Uuid) -> Result<bool, StoreError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(ENDPOINTS)?;
            let removed = table.remove(id.as_u128())?.is_some();
            // Whitelist rows die with their endpoint.
            let mut whitelist = txn.open_table(WHITELIST)?;
            let stale: Vec<(u128, u32)> = whitelist
                .range((id.as_u128(), u32::MIN)..=(id.as_u128(), u32::MAX))?
                .map(|row| row.map(|(key, _)| key.value()))
                .collect::<Result<_, _>>()?;
            for key in stale {
                whitelist.remove(key)?;
            }
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    // Nodes

    pub fn put_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(node)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(NODES)?;
            table.insert(node.id.as_u128(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(NODES)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    pub fn delete_node(&self, id: Uuid) -> Result<bool, StoreError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(NODES)?;
            let existed = table.remove(id.as_u128())?.is_some();
            existed
        };
        txn.commit()?;
        Ok(removed)
    }

    // Blacklist

    pub fn put_blacklist(&self, ip: Ipv4Addr, until_epoch_ms: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(BLACKLIST)?;
            table.insert(u32::from(ip), until_epoch_ms)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn blacklist_rows(&self) -> Result<Vec<(Ipv4Addr, u64)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLACKLIST)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            out.push((Ipv4Addr::from(key.value()), value.value()));
        }
        Ok(out)
    }

    pub fn delete_blacklist(&self, ip: Ipv4Addr) -> Result<bool, StoreError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(BLACKLIST)?;
            let existed = table.remove(u32::from(ip))?.is_some();
            existed
        };
        txn.commit()?;
        Ok(removed)
    }

    // Per-endpoint whitelists

    pub fn add_whitelist(&self, endpoint: Uuid, ip: Ipv4Addr) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(WHITELIST)?;
            table.insert((endpoint.as_u128(), u32::from(ip)), ())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn remove_whitelist(&self, endpoint: Uuid, ip: Ipv4Addr) -> Result<bool, StoreError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(WHITELIST)?;
            let existed = table.remove((endpoint.as_u128(), u32::from(ip)))?.is_some();
            existed
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn whitelist(&self, endpoint: Uuid) -> Result<Vec<Ipv4Addr>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(WHITELIST)?;
        let mut out = Vec::new();
        for row in table.range((endpoint.as_u128(), u32::MIN)..=(endpoint.as_u128(), u32::MAX))? {
            let (key, _) = row?;
            out.push(Ipv4Addr::from(key.value().1));
        }
        Ok(out)
    }

    // Metrics summaries

    pub fn record_metrics(&self, epoch_ms: u64, snapshot: &CounterSnapshot) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(snapshot)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(METRICS)?;
            table.insert(epoch_ms, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Snapshots at or after `since_epoch_ms`, oldest first.
    pub fn metrics_since(&self, since_epoch_ms: u64) -> Result<Vec<(u64, CounterSnapshot)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METRICS)?;
        let mut out = Vec::new();
        for row in table.range(since_epoch_ms..)? {
            let (key, value) = row?;
            out.push((key.value(), serde_json::from_slice(value.value())?));
        }
        Ok(out)
    }
}
