//! The configuration file.
//!
//! A single TOML document with `api`, `database`, `node`, `proxy` and
//! `security` sections. Every value falls back to a stated default, so an
//! empty file is a valid configuration. Unknown keys are rejected.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub node: NodeConfig,
    pub proxy: ProxyConfig,
    pub security: SecurityConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.security.enable_tls {
            anyhow::bail!(
                "security.enable_tls is not supported by this build; terminate TLS ahead of the proxy"
            );
        }
        if self.proxy.buffer_size == 0 {
            anyhow::bail!("proxy.buffer_size must be nonzero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub address: String,
    /// Seconds.
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub idle_timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> ApiConfig {
        ApiConfig {
            address: String::from("0.0.0.0:8080"),
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 120,
        }
    }
}

/// Durable-store settings. This build embeds its store, so `database` names
/// the file path; the connection-pool keys are accepted for compatibility
/// with external stores.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    /// Seconds.
    pub max_lifetime: u64,
}

impl Default for DatabaseConfig {
    fn default() -> DatabaseConfig {
        DatabaseConfig {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("rampart.redb"),
            username: String::new(),
            password: String::new(),
            ssl_mode: String::from("disable"),
            max_open_conns: 25,
            max_idle_conns: 5,
            max_lifetime: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Seconds between metrics/update pushes.
    pub update_interval: u64,
    /// Seconds between node health checks.
    pub health_check_interval: u64,
    pub max_nodes: usize,
    /// Seconds before a node call is abandoned.
    pub node_timeout: u64,
    pub retry_attempts: u32,
    /// Seconds.
    pub retry_delay: u64,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            update_interval: 10,
            health_check_interval: 10,
            max_nodes: 100,
            node_timeout: 5,
            retry_attempts: 3,
            retry_delay: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub enable_tcp_proxy: bool,
    pub enable_udp_proxy: bool,
    /// Seconds. Origin dial deadline and Java opening-payload deadline.
    pub tcp_timeout: u64,
    /// Seconds. Bedrock session idle expiry.
    pub udp_timeout: u64,
    pub max_connections: usize,
    pub buffer_size: usize,
    /// Interface the data-plane filter attaches to.
    pub xdp_interface: String,
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            enable_tcp_proxy: true,
            enable_udp_proxy: true,
            tcp_timeout: 30,
            udp_timeout: 10,
            max_connections: 10_000,
            buffer_size: 4096,
            xdp_interface: String::from("eth0"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    pub enable_tls: bool,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub enable_jwt: bool,
    /// Bearer secret. With `enable_jwt` the bearer value is validated as an
    /// HS256 token signed with this secret; otherwise it is compared
    /// directly. Empty disables authentication.
    pub jwt_secret: String,
    /// Seconds.
    pub jwt_expiry: u64,
}

impl Default for SecurityConfig {
    fn default() -> SecurityConfig {
        SecurityConfig {
            enable_tls: false,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            enable_jwt: false,
            jwt_secret: String::new(),
            jwt_expiry: 3600,
        }
    }
}

impl NodeConfig {
    pub fn health_check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.health_check_interval.max(1))
    }

    pub fn node_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.node_timeout.max(1))
    }

    pub fn update_interval_duration(&self) -> Duration {
        Duration::from_secs(self.update_interval.max(1))
    }
}
