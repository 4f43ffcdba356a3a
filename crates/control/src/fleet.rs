//! The edge-node fleet manager.
//!
//! Tracks nodes, distributes endpoint changes to the live ones, and polls
//! each node's control address on a cadence. Two consecutive failed polls
//! mark a node inactive; a successful poll while inactive brings it back
//! and triggers a full resync. The store stays authoritative throughout —
//! a node's reported endpoint set is reconciled toward it, never the other
//! way around.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use maps::{Endpoint, EndpointEvent};
use util::time::epoch_ms;

use crate::{PushEvent, Store, StoreError};

/// Consecutive poll failures before a node is marked inactive.
const FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("{0}")]
    Invalid(String),
    #[error("no such node: {0}")]
    NotFound(Uuid),
    #[error("node limit reached ({0})")]
    Exhausted(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
    Maintenance,
}

/// One edge node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: Uuid,
    pub name: String,
    /// Data-plane front address.
    pub data_addr: String,
    /// Base URL of the node's control interface.
    pub control_addr: String,
    pub interface: String,
    pub status: NodeStatus,
    /// Wall-clock ms of the last successful poll.
    pub last_seen_ms: u64,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub packet_rate: f64,
    #[serde(default)]
    pub failures: u32,
    /// Endpoint set the node reported last.
    #[serde(default)]
    pub endpoints: Vec<Uuid>,
}

/// Registration payload a node calls in with.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRegistration {
    pub name: String,
    pub data_addr: String,
    pub control_addr: String,
    pub interface: String,
}

/// Health report returned by a node's `/api/v1/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeStatusReport {
    pub status: NodeStatus,
    #[serde(default)]
    pub cpu_usage: f32,
    #[serde(default)]
    pub memory_usage: f32,
    #[serde(default)]
    pub packet_rate: f64,
    #[serde(default)]
    pub endpoints: Vec<Uuid>,
}

/// Command body for a node's `/api/v1/endpoint`. Add and update carry the
/// full record; remove only needs the id.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CommandPayload<'a> {
    Full(&'a Endpoint),
    Id { id: Uuid },
}

#[derive(Debug, Serialize)]
struct EndpointCommand<'a> {
    action: &'static str,
    endpoint: CommandPayload<'a>,
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub health_check_interval: Duration,
    pub node_timeout: Duration,
    pub max_nodes: usize,
}

impl Default for FleetConfig {
    fn default() -> FleetConfig {
        FleetConfig {
            health_check_interval: Duration::from_secs(10),
            node_timeout: Duration::from_secs(5),
            max_nodes: 100,
        }
    }
}

pub struct FleetManager {
    nodes: DashMap<Uuid, NodeRecord>,
    store: Arc<Store>,
    http: reqwest::Client,
    push: broadcast::Sender<PushEvent>,
    cfg: FleetConfig,
}

impl FleetManager {
    pub fn new(
        store: Arc<Store>,
        push: broadcast::Sender<PushEvent>,
        cfg: FleetConfig,
    ) -> anyhow::Result<FleetManager> {
        let http = reqwest::Client::builder()
            .timeout(cfg.node_timeout)
            .build()?;
        Ok(FleetManager { nodes: DashMap::new(), store, http, push, cfg })
    }

    /// Loads known nodes from the store at boot.
    pub fn load(&self) -> Result<(), FleetError> {
        for node in self.store.nodes()? {
            self.nodes.insert(node.id, node);
        }
        tracing::info!("fleet loaded with {} nodes", self.nodes.len());
        Ok(())
    }

    pub fn register(&self, registration: NodeRegistration) -> Result<NodeRecord, FleetError> {
        if self.nodes.len() >= self.cfg.max_nodes {
            return Err(FleetError::Exhausted(self.cfg.max_nodes));
        }
        // Two live nodes may not share a front address.
        let clash = self.nodes.iter().any(|n| {
            n.data_addr == registration.data_addr && n.status != NodeStatus::Inactive
        });
        if clash {
            return Err(FleetError::Invalid(format!(
                "front address {} is already served by a live node",
                registration.data_addr
            )));
        }

        let node = NodeRecord {
            id: Uuid::new_v4(),
            name: registration.name,
            data_addr: registration.data_addr,
            control_addr: registration.control_addr,
            interface: registration.interface,
            status: NodeStatus::Active,
            last_seen_ms: epoch_ms(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            packet_rate: 0.0,
            failures: 0,
            endpoints: Vec::new(),
        };
        self.store.put_node(&node)?;
        self.nodes.insert(node.id, node.clone());
        tracing::info!("node {} ({}) registered", node.name, node.id);
        let _ = self.push.send(PushEvent::NodeStatusUpdate(node.clone()));
        Ok(node)
    }

    pub fn decommission(&self, id: Uuid) -> Result<(), FleetError> {
        self.nodes.remove(&id).ok_or(FleetError::NotFound(id))?;
        self.store.delete_node(id)?;
        tracing::info!("node {id} decommissioned");
        Ok(())
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn node(&self, id: Uuid) -> Option<NodeRecord> {
        self.nodes.get(&id).map(|entry| entry.value().clone())
    }

    /// Pushes one endpoint change to every active node. A failed push does
    /// not fail the operator request; the change is durable and the next
    /// successful health check reconciles it.
    pub async fn rollout(self: &Arc<Self>, event: &EndpointEvent) {
        let action = match event {
            EndpointEvent::Added(_) => "add",
            EndpointEvent::Removed(_) => "remove",
            EndpointEvent::Updated(_) => "update",
        };
        let endpoint = event.endpoint().clone();

        let mut pushes = JoinSet::new();
        for entry in self.nodes.iter() {
            if entry.status != NodeStatus::Active {
                continue;
            }
            let manager = Arc::clone(self);
            let node = entry.value().clone();
            let endpoint = endpoint.clone();
            pushes.spawn(async move {
                if let Err(e) = manager.push_endpoint(&node, action, &endpoint).await {
                    tracing::warn!("endpoint {action} push to node {} failed: {e}", node.id);
                }
            });
        }
        while pushes.join_next().await.is_some() {}
    }

    async fn push_endpoint(
        &self,
        node: &NodeRecord,
        action: &'static str,
        endpoint: &Endpoint,
    ) -> anyhow::Result<()> {
        self.push_command(node, EndpointCommand { action, endpoint: CommandPayload::Full(endpoint) })
            .await
    }

    async fn push_removal(&self, node: &NodeRecord, id: Uuid) -> anyhow::Result<()> {
        self.push_command(node, EndpointCommand { action: "remove", endpoint: CommandPayload::Id { id } })
            .await
    }

    async fn push_command(&self, node: &NodeRecord, command: EndpointCommand<'_>) -> anyhow::Result<()> {
        let url = format!("{}/api/v1/endpoint", node.control_addr.trim_end_matches('/'));
        self.http.post(url).json(&command).send().await?.error_for_status()?;
        Ok(())
    }

    /// Polls every node concurrently; a slow node delays nobody.
    pub async fn heartbeat_all(self: &Arc<Self>) {
        let ids: Vec<Uuid> = self.nodes.iter().map(|entry| *entry.key()).collect();
        let mut polls = JoinSet::new();
        for id in ids {
            let manager = Arc::clone(self);
            polls.spawn(async move { manager.poll_node(id).await });
        }
        while polls.join_next().await.is_some() {}
    }

    async fn poll_node(&self, id: Uuid) {
        let Some(node) = self.node(id) else { return };
        let url = format!("{}/api/v1/status", node.control_addr.trim_end_matches('/'));

        let report = match self.http.get(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => match response.json::<NodeStatusReport>().await {
                Ok(report) => report,
                Err(e) => {
                    self.record_failure(id, &e.to_string());
                    return;
                }
            },
            Err(e) => {
                self.record_failure(id, &e.to_string());
                return;
            }
        };

        let was_inactive = node.status == NodeStatus::Inactive;
        let updated = {
            let Some(mut entry) = self.nodes.get_mut(&id) else { return };
            entry.failures = 0;
            entry.last_seen_ms = epoch_ms();
            entry.cpu_usage = report.cpu_usage;
            entry.memory_usage = report.memory_usage;
            entry.packet_rate = report.packet_rate;
            entry.endpoints = report.endpoints.clone();
            // A reachable node is active unless it asked for maintenance.
            entry.status = match report.status {
                NodeStatus::Maintenance => NodeStatus::Maintenance,
                _ => NodeStatus::Active,
            };
            entry.value().clone()
        };
        if let Err(e) = self.store.put_node(&updated) {
            tracing::warn!("unable to persist node {id}: {e}");
        }
        let _ = self.push.send(PushEvent::NodeStatusUpdate(updated.clone()));

        if was_inactive {
            tracing::info!("node {id} recovered; resyncing its endpoint set");
        }
        self.reconcile(&updated, was_inactive).await;
    }

    fn record_failure(&self, id: Uuid, reason: &str) {
        let Some(mut entry) = self.nodes.get_mut(&id) else { return };
        entry.failures += 1;
        tracing::debug!("health check for node {id} failed ({}): {reason}", entry.failures);
        if entry.failures >= FAILURE_THRESHOLD && entry.status == NodeStatus::Active {
            entry.status = NodeStatus::Inactive;
            let updated = entry.value().clone();
            drop(entry);
            tracing::warn!("node {id} marked inactive after {FAILURE_THRESHOLD} failed health checks");
            if let Err(e) = self.store.put_node(&updated) {
                tracing::warn!("unable to persist node {id}: {e}");
            }
            let _ = self.push.send(PushEvent::NodeStatusUpdate(updated));
        }
    }

    /// Issues the difference between the authoritative endpoint set and the
    /// set the node reported. On recovery the full set is pushed.
    async fn reconcile(&self, node: &NodeRecord, full_resync: bool) {
        let authoritative = match self.store.endpoints() {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!("unable to read endpoints for reconciliation: {e}");
                return;
            }
        };

        for endpoint in &authoritative {
            if full_resync || !node.endpoints.contains(&endpoint.id) {
                if let Err(e) = self.push_endpoint(node, "add", endpoint).await {
                    tracing::warn!("reconcile add to node {} failed: {e}", node.id);
                }
            }
        }
        // Endpoints the node still holds but the store no longer knows.
        for reported in &node.endpoints {
            if !authoritative.iter().any(|e| e.id == *reported) {
                if let Err(e) = self.push_removal(node, *reported).await {
                    tracing::warn!("reconcile remove to node {} failed: {e}", node.id);
                }
            }
        }
    }

    /// Heartbeats and rollouts until cancellation.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<EndpointEvent>,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.cfg.health_check_interval);
        // The first tick fires immediately; skip it so freshly-registered
        // nodes are not polled before they settle.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.heartbeat_all().await,
                event = events.recv() => match event {
                    Ok(event) => self.rollout(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("fleet manager lagged {skipped} endpoint events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("fleet manager stopped");
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;

    use maps::{EndpointKind, Maps};

    use super::*;
    use crate::{EndpointSpec, Store, Synchronizer};

    /// A fake edge node: health can be toggled, received endpoint commands
    /// are remembered and echoed back in the status report.
    #[derive(Default)]
    struct StubNode {
        healthy: AtomicBool,
        endpoints: Mutex<Vec<Uuid>>,
    }

    async fn stub_status(State(stub): State<Arc<StubNode>>) -> Result<Json<serde_json::Value>, StatusCode> {
        if !stub.healthy.load(Ordering::SeqCst) {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Ok(Json(serde_json::json!({
            "status": "active",
            "cpu_usage": 0.25,
            "memory_usage": 0.5,
            "packet_rate": 120.0,
            "endpoints": *stub.endpoints.lock(),
        })))
    }

    async fn stub_command(
        State(stub): State<Arc<StubNode>>,
        Json(command): Json<serde_json::Value>,
    ) -> StatusCode {
        let id: Uuid = serde_json::from_value(command["endpoint"]["id"].clone()).unwrap();
        let mut endpoints = stub.endpoints.lock();
        match command["action"].as_str() {
            Some("add") | Some("update") => {
                if !endpoints.contains(&id) {
                    endpoints.push(id);
                }
            }
            Some("remove") => endpoints.retain(|e| *e != id),
            _ => return StatusCode::BAD_REQUEST,
        }
        StatusCode::OK
    }

    async fn spawn_stub() -> (Arc<StubNode>, String) {
        let stub = Arc::new(StubNode::default());
        let app = Router::new()
            .route("/api/v1/status", get(stub_status))
            .route("/api/v1/endpoint", post(stub_command))
            .with_state(Arc::clone(&stub));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (stub, format!("http://{addr}"))
    }

    fn test_fleet(store: Arc<Store>) -> Arc<FleetManager> {
        let (push, _) = broadcast::channel(64);
        let cfg = FleetConfig {
            health_check_interval: Duration::from_millis(100),
            node_timeout: Duration::from_secs(1),
            max_nodes: 4,
        };
        Arc::new(FleetManager::new(store, push, cfg).unwrap())
    }

    #[tokio::test]
    async fn node_loss_and_recovery_converges() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("fleet.redb")).unwrap());
        let maps = Arc::new(Maps::new());
        let sync = Synchronizer::new(maps, Arc::clone(&store));

        let (stub, control_addr) = spawn_stub().await;
        let fleet = test_fleet(Arc::clone(&store));
        let node = fleet
            .register(NodeRegistration {
                name: String::from("edge-1"),
                data_addr: String::from("198.51.100.10"),
                control_addr,
                interface: String::from("eth0"),
            })
            .unwrap();

        // Two consecutive failed health checks mark the node inactive.
        fleet.heartbeat_all().await;
        assert_eq!(fleet.node(node.id).unwrap().status, NodeStatus::Active);
        fleet.heartbeat_all().await;
        assert_eq!(fleet.node(node.id).unwrap().status, NodeStatus::Inactive);

        // An operator change while the node is down: durable, push skipped.
        let endpoint = sync
            .add_endpoint(EndpointSpec {
                kind: EndpointKind::Java,
                front_ip: Ipv4Addr::new(198, 51, 100, 10),
                front_port: 25565,
                origin_ip: Ipv4Addr::new(203, 0, 113, 5),
                origin_port: 25565,
                rate_limit: 1000,
                burst_limit: 5000,
                maintenance: false,
                active: true,
            })
            .unwrap();
        fleet.rollout(&EndpointEvent::Added(endpoint.clone())).await;
        assert!(stub.endpoints.lock().is_empty());

        // Recovery: the next poll succeeds, the node turns active and the
        // authoritative set is pushed in full.
        stub.healthy.store(true, Ordering::SeqCst);
        fleet.heartbeat_all().await;
        let recovered = fleet.node(node.id).unwrap();
        assert_eq!(recovered.status, NodeStatus::Active);
        assert_eq!(*stub.endpoints.lock(), vec![endpoint.id]);

        // The following poll reports the converged set; no duplicates.
        fleet.heartbeat_all().await;
        assert_eq!(*stub.endpoints.lock(), vec![endpoint.id]);
        assert_eq!(fleet.node(node.id).unwrap().endpoints, vec![endpoint.id]);
    }

    #[tokio::test]
    async fn rollout_reaches_active_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("fleet.redb")).unwrap());

        let (stub, control_addr) = spawn_stub().await;
        stub.healthy.store(true, Ordering::SeqCst);
        let fleet = test_fleet(store);
        fleet
            .register(NodeRegistration {
                name: String::from("edge-1"),
                data_addr: String::from("198.51.100.11"),
                control_addr,
                interface: String::from("eth0"),
            })
            .unwrap();

        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            kind: EndpointKind::Bedrock,
            front_ip: Ipv4Addr::new(198, 51, 100, 11),
            front_port: 19132,
            origin_ip: Ipv4Addr::new(203, 0, 113, 6),
            origin_port: 19132,
            rate_limit: 500,
            burst_limit: 500,
            maintenance: false,
            active: true,
        };
        fleet.rollout(&EndpointEvent::Added(endpoint.clone())).await;
        assert_eq!(*stub.endpoints.lock(), vec![endpoint.id]);

        fleet.rollout(&EndpointEvent::Removed(endpoint.clone())).await;
        assert!(stub.endpoints.lock().is_empty());
    }

    #[test]
    fn registration_rejects_live_front_clash() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("fleet.redb")).unwrap());
        let (push, _) = broadcast::channel(4);
        let fleet = FleetManager::new(store, push, FleetConfig::default()).unwrap();

        let registration = NodeRegistration {
            name: String::from("edge-1"),
            data_addr: String::from("198.51.100.12"),
            control_addr: String::from("http://127.0.0.1:1"),
            interface: String::from("eth0"),
        };
        fleet.register(registration.clone()).unwrap();
        assert!(matches!(fleet.register(registration), Err(FleetError::Invalid(_))));
    }
}
