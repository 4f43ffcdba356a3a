//! Thin HTTP client behind the operator CLI verbs.

use std::net::Ipv4Addr;

use anyhow::Context;
use serde_json::json;

use maps::{CounterSnapshot, Endpoint, EndpointKind, Protocol};

pub struct ApiClient {
    base: String,
    token: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> anyhow::Result<ApiClient> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("unable to build HTTP client")?;
        Ok(ApiClient { base: base.into().trim_end_matches('/').to_owned(), token: token.into(), http })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base));
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    /// Turns an error response into the server's own message.
    async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let detail = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_owned))
            .unwrap_or_else(|| String::from("no detail"));
        anyhow::bail!("request failed with {status}: {detail}")
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_endpoint(
        &self,
        front_ip: Ipv4Addr,
        front_port: u16,
        l4: Protocol,
        origin_ip: Ipv4Addr,
        origin_port: u16,
        kind: EndpointKind,
        rate: u32,
        burst: u32,
    ) -> anyhow::Result<Endpoint> {
        if kind.protocol() != l4 {
            anyhow::bail!("kind {kind} requires {} but {l4} was given", kind.protocol());
        }
        let response = self
            .request(reqwest::Method::POST, "/api/v1/endpoints")
            .json(&json!({
                "kind": kind,
                "front_ip": front_ip,
                "front_port": front_port,
                "origin_ip": origin_ip,
                "origin_port": origin_port,
                "rate_limit": rate,
                "burst_limit": burst,
            }))
            .send()
            .await?;
        let body: serde_json::Value = Self::check(response).await?.json().await?;
        serde_json::from_value(body["endpoint"].clone()).context("malformed endpoint response")
    }

    pub async fn remove_endpoint(
        &self,
        front_ip: Ipv4Addr,
        front_port: u16,
        l4: Protocol,
    ) -> anyhow::Result<()> {
        let response = self.request(reqwest::Method::GET, "/api/v1/endpoints?limit=10000").send().await?;
        let body: serde_json::Value = Self::check(response).await?.json().await?;
        let endpoints: Vec<Endpoint> =
            serde_json::from_value(body["endpoints"].clone()).context("malformed endpoint list")?;

        let target = endpoints
            .iter()
            .find(|e| {
                e.front_ip == front_ip && e.front_port == front_port && e.kind.protocol() == l4
            })
            .with_context(|| format!("no endpoint at {front_ip}:{front_port}/{l4}"))?;

        let response = self
            .request(reqwest::Method::DELETE, &format!("/api/v1/endpoints/{}", target.id))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn blacklist(&self, ip: Ipv4Addr, ttl_ms: u64) -> anyhow::Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/api/v1/blacklist")
            .json(&json!({ "ip": ip, "ttl_ms": ttl_ms }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn unblacklist(&self, ip: Ipv4Addr) -> anyhow::Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/api/v1/blacklist/{ip}"))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn stats(&self) -> anyhow::Result<CounterSnapshot> {
        let response = self.request(reqwest::Method::GET, "/api/v1/system/stats").send().await?;
        let body: serde_json::Value = Self::check(response).await?.json().await?;
        serde_json::from_value(body["stats"].clone()).context("malformed stats response")
    }
}
