//! The loadable policy object.
//!
//! `rampart load <iface> <obj>` attaches the filter with a policy snapshot:
//! a TOML document listing protected endpoints and blacklist rows, installed
//! into the shared maps before the relays come up.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use uuid::Uuid;

use control::EndpointSpec;
use maps::{BlacklistEntry, Endpoint, Maps};
use util::time::now_ms;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyObject {
    #[serde(default, rename = "endpoint")]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default, rename = "blacklist")]
    pub blacklist: Vec<BlacklistRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlacklistRule {
    pub ip: Ipv4Addr,
    pub ttl_ms: u64,
}

impl PolicyObject {
    pub fn load(path: &Path) -> anyhow::Result<PolicyObject> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read policy object {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("unable to parse policy object {}", path.display()))
    }

    /// Installs the snapshot into the maps.
    pub fn install(&self, maps: &Maps) -> anyhow::Result<()> {
        for spec in &self.endpoints {
            if spec.rate_limit < 1 || spec.burst_limit < spec.rate_limit {
                anyhow::bail!(
                    "endpoint {}:{} has invalid limits (rate {}, burst {})",
                    spec.front_ip,
                    spec.front_port,
                    spec.rate_limit,
                    spec.burst_limit
                );
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
            let key = endpoint.front_key();
            if maps.endpoints.contains(&key) {
                anyhow::bail!("duplicate front address {}:{}", spec.front_ip, spec.front_port);
            }
            maps.endpoints
                .insert(key, endpoint)
                .map_err(|e| anyhow::anyhow!("unable to install endpoint: {e}"))?;
        }

        for rule in &self.blacklist {
            maps.blacklist
                .insert(u32::from(rule.ip), BlacklistEntry { blocked_until_ms: now_ms() + rule.ttl_ms })
                .map_err(|e| anyhow::anyhow!("unable to install blacklist row: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_and_installs_snapshot() {
        let raw = r#"
            [[endpoint]]
            kind = "java"
            front_ip = "198.51.100.10"
            front_port = 25565
            origin_ip = "203.0.113.5"
            origin_port = 25565
            rate_limit = 1000
            burst_limit = 5000

            [[endpoint]]
            kind = "bedrock"
            front_ip = "198.51.100.10"
            front_port = 19132
            origin_ip = "203.0.113.5"
            origin_port = 19132
            rate_limit = 500
            burst_limit = 1000
            maintenance = true

            [[blacklist]]
            ip = "1.2.3.4"
            ttl_ms = 60000
        "#;
        let policy: PolicyObject = toml::from_str(raw).unwrap();
        assert_eq!(policy.endpoints.len(), 2);

        let maps = Maps::new();
        policy.install(&maps).unwrap();
        assert_eq!(maps.endpoints.len(), 2);
        assert!(maps.blacklist.contains(&u32::from(Ipv4Addr::new(1, 2, 3, 4))));

        // A second install collides on the front addresses.
        assert!(policy.install(&maps).is_err());
    }

    #[test]
    fn rejects_bad_limits() {
        let raw = r#"
            [[endpoint]]
            kind = "java"
            front_ip = "198.51.100.10"
            front_port = 25565
            origin_ip = "203.0.113.5"
            origin_port = 25565
            rate_limit = 100
            burst_limit = 10
        "#;
        let policy: PolicyObject = toml::from_str(raw).unwrap();
        assert!(policy.install(&Maps::new()).is_err());
    }
}
