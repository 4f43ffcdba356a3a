use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use maps::{Endpoint, EndpointEvent, EndpointKind, Maps};

use crate::{BedrockRelay, FlowTable, JavaRelay, RelayMetrics};

/// Relay tuning knobs, filled from the `proxy` config section.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub enable_tcp: bool,
    pub enable_udp: bool,
    /// Deadline for the origin dial.
    pub dial_timeout: Duration,
    /// Deadline for a Java client's opening payload.
    pub tcp_timeout: Duration,
    /// Idle expiry for Bedrock sessions.
    pub udp_timeout: Duration,
    pub max_connections: usize,
    pub buffer_size: usize,
    /// Drain window granted to live flows on shutdown.
    pub grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> RelayConfig {
        RelayConfig {
            enable_tcp: true,
            enable_udp: true,
            dial_timeout: Duration::from_secs(30),
            tcp_timeout: Duration::from_secs(30),
            udp_timeout: Duration::from_secs(10),
            max_connections: 10_000,
            buffer_size: 4096,
            grace: Duration::from_secs(5),
        }
    }
}

/// Everything a relay task needs, cheap to clone.
#[derive(Clone)]
pub struct RelayContext {
    pub maps: Arc<Maps>,
    pub flows: Arc<FlowTable>,
    pub metrics: Arc<RelayMetrics>,
    pub cfg: RelayConfig,
    /// Root token for in-flight stream flows. Cancelled only after the
    /// grace window, so stopping accept does not cut live connections.
    pub flow_token: CancellationToken,
}

/// Owns one listener task per active endpoint and applies endpoint changes
/// coming from the synchronizer.
pub struct RelaySupervisor {
    ctx: RelayContext,
    listeners: DashMap<u64, CancellationToken>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    token: CancellationToken,
}

impl RelaySupervisor {
    pub fn new(ctx: RelayContext, token: CancellationToken) -> RelaySupervisor {
        RelaySupervisor {
            ctx,
            listeners: DashMap::new(),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            token,
        }
    }

    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }

    /// Spawns relays for every endpoint already present in the maps. Called
    /// once after the boot-time resync.
    pub async fn sync_existing(&self) {
        let endpoints: Vec<Endpoint> =
            self.ctx.maps.endpoints.iter().map(|entry| entry.value().clone()).collect();
        for endpoint in endpoints {
            self.spawn_endpoint(&endpoint).await;
        }
    }

    pub async fn apply(&self, event: &EndpointEvent) {
        match event {
            EndpointEvent::Added(endpoint) => self.spawn_endpoint(endpoint).await,
            EndpointEvent::Removed(endpoint) => {
                if let Some((_, token)) = self.listeners.remove(&endpoint.front_key()) {
                    token.cancel();
                    tracing::info!("relay for {} stopped", endpoint.id);
                }
            }
            EndpointEvent::Updated(endpoint) => {
                // Policy lives in the shared maps; only a missing listener
                // (endpoint flipped back to active) needs action here.
                if !self.listeners.contains_key(&endpoint.front_key()) {
                    self.spawn_endpoint(endpoint).await;
                }
            }
        }
    }

    async fn spawn_endpoint(&self, endpoint: &Endpoint) {
        let key = endpoint.front_key();
        if self.listeners.contains_key(&key) {
            return;
        }
        let enabled = match endpoint.kind {
            EndpointKind::Java => self.ctx.cfg.enable_tcp,
            EndpointKind::Bedrock => self.ctx.cfg.enable_udp,
        };
        if !enabled {
            tracing::warn!("{} relays are disabled; endpoint {} has no listener", endpoint.kind, endpoint.id);
            return;
        }

        let addr = SocketAddr::new(IpAddr::V4(endpoint.front_ip), endpoint.front_port);
        let token = self.token.child_token();
        let mut tasks = self.tasks.lock().await;
        match endpoint.kind {
            EndpointKind::Java => match JavaRelay::bind(addr, self.ctx.clone()).await {
                Ok(relay) => {
                    let task_token = token.clone();
                    tasks.spawn(async move { relay.run(task_token).await });
                    self.listeners.insert(key, token);
                    tracing::info!("Java relay listening at {addr} for endpoint {}", endpoint.id);
                }
                Err(e) => tracing::error!("unable to start Java relay at {addr}: {e:#}"),
            },
            EndpointKind::Bedrock => match BedrockRelay::bind(addr, self.ctx.clone()).await {
                Ok(relay) => {
                    let task_token = token.clone();
                    tasks.spawn(async move { relay.run(task_token).await });
                    self.listeners.insert(key, token);
                    tracing::info!("Bedrock relay listening at {addr} for endpoint {}", endpoint.id);
                }
                Err(e) => tracing::error!("unable to start Bedrock relay at {addr}: {e:#}"),
            },
        }
    }

    /// Stops accepting, grants live flows the grace window, then forcibly
    /// closes whatever is left.
    pub async fn shutdown(&self) {
        self.token.cancel();

        // Listener tasks exit promptly once cancelled.
        {
            let mut tasks = self.tasks.lock().await;
            let drain = async {
                while tasks.join_next().await.is_some() {}
            };
            if timeout(self.ctx.cfg.grace, drain).await.is_err() {
                tracing::warn!("relay listeners did not stop in time, aborting");
                tasks.abort_all();
            }
        }

        // In-flight flows drain inside the grace window.
        let deadline = tokio::time::Instant::now() + self.ctx.cfg.grace;
        while !self.ctx.flows.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.ctx.flows.len();
        if remaining > 0 {
            tracing::warn!("forcing {remaining} flows closed after {:?} grace", self.ctx.cfg.grace);
        }
        self.ctx.flow_token.cancel();
    }
}
