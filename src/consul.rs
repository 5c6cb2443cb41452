//! HTTP client for the Consul agent API.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cache::entry::{Endpoint, ServiceKey};
use crate::error::Error;

/// Client for the Consul agent health and self endpoints.
///
/// Handles are cheap to clone and share one HTTP connection pool. The
/// default datacenter is fetched from `/v1/agent/self` once on first use.
#[derive(Clone)]
pub struct ConsulClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
    datacenter: OnceCell<String>,
}

impl ConsulClient {
    /// Create a client for the agent at `address` (`scheme://host:port`).
    ///
    /// `timeout` bounds each health request; it equals the cache TTL so a
    /// fetch can never outlive the entry it populates.
    pub fn new(address: &str, timeout: Duration) -> Result<Self, Error> {
        let base = Url::parse(address)
            .map_err(|err| Error::Config(format!("invalid agent address {address:?}: {err}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(2 * timeout)
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base,
                timeout,
                datacenter: OnceCell::new(),
            }),
        })
    }

    /// Fetch the passing endpoints for `key`, keeping only addresses in
    /// the key's family. The result is unordered; the cache shuffles it.
    pub async fn service_endpoints(&self, key: &ServiceKey) -> Result<Vec<Endpoint>, Error> {
        let mut url = self.inner.base.clone();
        url.set_path(&format!("/v1/health/service/{}", key.name()));
        {
            let mut query = url.query_pairs_mut();
            query.append_key_only("passing");
            if !key.tag().is_empty() {
                query.append_pair("tag", key.tag());
            }
            if !key.dc().is_empty() {
                query.append_pair("dc", key.dc());
            }
        }

        let request = self.inner.http.get(url.clone());
        let request = if self.inner.timeout.is_zero() {
            request
        } else {
            request.timeout(self.inner.timeout)
        };

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let checks: Vec<HealthService> = response.json().await?;
        let family = key.family();
        let endpoints = checks
            .into_iter()
            .filter_map(|check| {
                let addr: IpAddr = check.service.address.parse().ok()?;
                family.matches(addr).then(|| Endpoint {
                    addr,
                    port: check.service.port,
                    node: fqdn(&check.node.node),
                })
            })
            .collect();
        Ok(endpoints)
    }

    /// The agent's default datacenter, fetched once and cached for the
    /// lifetime of the client. Keys with an empty `dc` resolve against it.
    pub async fn default_datacenter(&self) -> Result<&str, Error> {
        let dc = self
            .inner
            .datacenter
            .get_or_try_init(|| async {
                let mut url = self.inner.base.clone();
                url.set_path("/v1/agent/self");

                let response = self.inner.http.get(url.clone()).send().await?;
                if response.status() != StatusCode::OK {
                    return Err(Error::UnexpectedStatus {
                        url: url.to_string(),
                        status: response.status(),
                    });
                }

                let agent: AgentSelf = response.json().await?;
                debug!(datacenter = %agent.config.datacenter, "discovered agent datacenter");
                Ok(agent.config.datacenter)
            })
            .await?;
        Ok(dc.as_str())
    }
}

/// Append a trailing dot when the node name is not already qualified.
fn fqdn(node: &str) -> String {
    if node.ends_with('.') {
        node.to_string()
    } else {
        format!("{node}.")
    }
}

// https://www.consul.io/api/health.html#list-nodes-for-service
#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Node")]
    node: NodeInfo,
    #[serde(rename = "Service")]
    service: ServiceInfo,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    #[serde(rename = "Node")]
    node: String,
}

#[derive(Debug, Deserialize)]
struct ServiceInfo {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

// https://www.consul.io/api/agent.html#read-configuration
#[derive(Debug, Deserialize)]
struct AgentSelf {
    #[serde(rename = "Config")]
    config: AgentConfig,
}

#[derive(Debug, Deserialize)]
struct AgentConfig {
    #[serde(rename = "Datacenter")]
    datacenter: String,
}
