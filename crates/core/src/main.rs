use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use prometheus_client::registry::Registry;
use tokio::runtime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

use control::Config;
use maps::{EndpointKind, Maps, Protocol};
use relay::{FlowTable, RelayContext, RelayMetrics, RelaySupervisor};

use rampart::client::ApiClient;
use rampart::instance::Instance;
use rampart::policy::PolicyObject;

#[derive(Debug, Parser)]
#[command(name = "rampart", version, about = "Edge DDoS mitigation proxy for Minecraft servers")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Control-plane API base URL, used by the operator verbs.
    #[arg(long, global = true, env = "RAMPART_API", default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Bearer token for the control-plane API.
    #[arg(long, global = true, env = "RAMPART_TOKEN", default_value = "")]
    token: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full proxy instance.
    Run,
    /// Attach the packet filter and relays to an interface with a policy
    /// object, without the control plane.
    Load { iface: String, object: PathBuf },
    /// Create a protected endpoint.
    AddEndpoint {
        front_ip: Ipv4Addr,
        front_port: u16,
        l4: Protocol,
        origin_ip: Ipv4Addr,
        origin_port: u16,
        kind: EndpointKind,
        rate: u32,
        burst: u32,
    },
    /// Remove the endpoint at a front address.
    RemoveEndpoint { front_ip: Ipv4Addr, front_port: u16, l4: Protocol },
    /// Block a source address for a while.
    Blacklist { ip: Ipv4Addr, ttl_ms: u64 },
    /// Unblock a source address.
    Unblacklist { ip: Ipv4Addr },
    /// Print the data-plane counters.
    Stats,
}

fn main() -> anyhow::Result<()> {
    init_logging().context("unable to initialise logging")?;
    let cli = Cli::parse();

    let runtime = runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("unable to build runtime")?;

    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run => {
            let config = load_config(cli.config.as_deref())?;
            let instance = Instance::start(config).await?;
            instance.run().await
        }
        Command::Load { iface, object } => {
            let config = load_config(cli.config.as_deref())?;
            load_dataplane(&iface, &object, config).await
        }
        Command::AddEndpoint {
            front_ip,
            front_port,
            l4,
            origin_ip,
            origin_port,
            kind,
            rate,
            burst,
        } => {
            let client = ApiClient::new(cli.api, cli.token)?;
            let endpoint = client
                .add_endpoint(front_ip, front_port, l4, origin_ip, origin_port, kind, rate, burst)
                .await?;
            println!("{}", endpoint.id);
            Ok(())
        }
        Command::RemoveEndpoint { front_ip, front_port, l4 } => {
            let client = ApiClient::new(cli.api, cli.token)?;
            client.remove_endpoint(front_ip, front_port, l4).await
        }
        Command::Blacklist { ip, ttl_ms } => {
            let client = ApiClient::new(cli.api, cli.token)?;
            client.blacklist(ip, ttl_ms).await
        }
        Command::Unblacklist { ip } => {
            let client = ApiClient::new(cli.api, cli.token)?;
            client.unblacklist(ip).await
        }
        Command::Stats => {
            let client = ApiClient::new(cli.api, cli.token)?;
            let stats = client.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Stand-alone data-plane attach: install the policy snapshot and run the
/// filtering relays until interrupted.
async fn load_dataplane(iface: &str, object: &Path, config: Config) -> anyhow::Result<()> {
    if !Path::new("/sys/class/net").join(iface).exists() {
        anyhow::bail!("unable to attach to interface {iface}: no such interface");
    }

    let policy = PolicyObject::load(object)?;
    let maps = Arc::new(Maps::new());
    policy.install(&maps)?;
    tracing::info!(
        "policy object installed on {iface}: {} endpoints, {} blacklist rows",
        maps.endpoints.len(),
        maps.blacklist.len()
    );

    let mut registry = Registry::default();
    let ctx = RelayContext {
        maps,
        flows: Arc::new(FlowTable::new()),
        metrics: Arc::new(RelayMetrics::new(&mut registry)),
        cfg: rampart::instance::relay_config(&config),
        flow_token: CancellationToken::new(),
    };
    let token = CancellationToken::new();
    let supervisor = Arc::new(RelaySupervisor::new(ctx, token.child_token()));
    supervisor.sync_existing().await;

    tokio::signal::ctrl_c().await.context("unable to listen for shutdown signal")?;
    tracing::info!("interrupt received, detaching");
    token.cancel();
    supervisor.shutdown().await;
    Ok(())
}

fn init_logging() -> anyhow::Result<()> {
    let max_level = LevelFilter::from_str(
        &std::env::vars()
            .find_map(|(k, v)| if k == "LOG_LEVEL" { Some(v) } else { None })
            .unwrap_or(String::from("info")),
    )?;

    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .with_thread_names(true)
        .init();

    Ok(())
}
