//! Contains the proxy instance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use control::{
    bind_api, serve_api, ApiContext, AuthSettings, Config, FleetConfig, FleetManager, PushEvent,
    Store, Synchronizer,
};
use maps::Maps;
use relay::{FlowTable, RelayConfig, RelayContext, RelayMetrics, RelaySupervisor};
use util::Joinable;

/// A fully wired proxy: shared maps, synchronizer, fleet manager, relays and
/// the control-plane API.
pub struct Instance {
    supervisor: Arc<RelaySupervisor>,
    metrics: Arc<RelayMetrics>,
    token: CancellationToken,
    services: Vec<JoinHandle<()>>,
    api_task: JoinHandle<anyhow::Result<()>>,
}

impl Instance {
    /// Builds and starts every component. Failure to open the store or bind
    /// the API listener is fatal.
    pub async fn start(config: Config) -> anyhow::Result<Arc<Instance>> {
        config.validate()?;
        let token = CancellationToken::new();

        let store = Arc::new(
            Store::open(&config.database.database)
                .with_context(|| format!("unable to open store at {}", config.database.database))?,
        );
        let maps = Arc::new(Maps::new());
        let sync = Arc::new(Synchronizer::new(Arc::clone(&maps), Arc::clone(&store)));
        sync.resync().context("boot-time resync failed")?;

        let (push, _) = broadcast::channel::<PushEvent>(256);

        let fleet = Arc::new(
            FleetManager::new(
                Arc::clone(&store),
                push.clone(),
                FleetConfig {
                    health_check_interval: config.node.health_check_interval_duration(),
                    node_timeout: config.node.node_timeout_duration(),
                    max_nodes: config.node.max_nodes,
                },
            )
            .context("unable to create fleet manager")?,
        );
        fleet.load()?;

        let mut registry = Registry::default();
        let metrics = Arc::new(RelayMetrics::new(&mut registry));
        let relay_ctx = RelayContext {
            maps: Arc::clone(&maps),
            flows: Arc::new(FlowTable::new()),
            metrics: Arc::clone(&metrics),
            cfg: relay_config(&config),
            flow_token: CancellationToken::new(),
        };
        let supervisor = Arc::new(RelaySupervisor::new(relay_ctx, token.child_token()));
        supervisor.sync_existing().await;

        let mut services = Vec::new();

        // Reaper.
        services.push(tokio::spawn(Arc::clone(&sync).run(token.child_token())));

        // Metrics summaries.
        services.push(tokio::spawn(Arc::clone(&sync).metrics_loop(
            config.node.update_interval_duration(),
            push.clone(),
            token.child_token(),
        )));

        // Fleet heartbeats and endpoint rollouts.
        services.push(tokio::spawn(Arc::clone(&fleet).run(sync.subscribe(), token.child_token())));

        // Endpoint changes toward the relay supervisor.
        services.push(tokio::spawn(apply_endpoint_events(
            Arc::clone(&supervisor),
            sync.subscribe(),
            token.child_token(),
        )));

        let ctx = Arc::new(ApiContext {
            maps,
            sync,
            fleet,
            store,
            push,
            auth: AuthSettings::from(&config.security),
        });
        let api_token = token.child_token();
        let listener = bind_api(&config.api.address).await?;
        let api_task = tokio::spawn(async move { serve_api(ctx, listener, api_token).await });

        Ok(Arc::new(Instance { supervisor, metrics, token, services, api_task }))
    }

    /// Serves until ctrl-c (or external cancellation), then shuts down in
    /// order: API, control loops, relays with their grace window.
    pub async fn run(self: Arc<Instance>) -> anyhow::Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => (),
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received, shutting down"),
        }
        self.shutdown().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn shutdown(self: Arc<Instance>) -> anyhow::Result<()> {
        self.token.cancel();

        let Ok(mut instance) = Arc::try_unwrap(self).map_err(|_| ()) else {
            anyhow::bail!("instance still referenced during shutdown");
        };

        match instance.api_task.join(Duration::from_secs(10)).await {
            Some(result) => result?,
            None => tracing::warn!("API task did not stop cleanly"),
        }

        for service in &mut instance.services {
            if service.join(Duration::from_secs(5)).await.is_none() {
                tracing::warn!("a control task did not stop cleanly");
            }
        }

        instance.supervisor.shutdown().await;

        tracing::info!(
            "relay totals: {} flows opened, {} refused, {} bytes in, {} bytes out, {} failed dials",
            instance.metrics.flows_opened.get(),
            instance.metrics.flows_refused.get(),
            instance.metrics.bytes_in.get(),
            instance.metrics.bytes_out.get(),
            instance.metrics.origin_dial_failures.get(),
        );
        Ok(())
    }
}

async fn apply_endpoint_events(
    supervisor: Arc<RelaySupervisor>,
    mut events: broadcast::Receiver<maps::EndpointEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => supervisor.apply(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("relay supervisor lagged {skipped} endpoint events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Maps the `proxy` config section onto the relay tuning knobs.
pub fn relay_config(config: &Config) -> RelayConfig {
    RelayConfig {
        enable_tcp: config.proxy.enable_tcp_proxy,
        enable_udp: config.proxy.enable_udp_proxy,
        dial_timeout: Duration::from_secs(config.proxy.tcp_timeout.max(1)),
        tcp_timeout: Duration::from_secs(config.proxy.tcp_timeout.max(1)),
        udp_timeout: Duration::from_secs(config.proxy.udp_timeout.max(1)),
        max_connections: config.proxy.max_connections,
        buffer_size: config.proxy.buffer_size,
        grace: Duration::from_secs(5),
    }
}
