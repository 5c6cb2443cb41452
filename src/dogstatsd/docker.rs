//! Container listing used to label DNS clients by image name.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::HOST;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::{TcpStream, UnixStream};

use crate::error::Error;

const DIAL_TIMEOUT: Duration = Duration::from_secs(4);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DOCKER_PORT: &str = "2376";

/// Where the container endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerHost {
    /// A Unix socket path.
    Unix(String),
    /// A TCP `host:port` address.
    Tcp(String),
}

impl DockerHost {
    /// Parse a host string: a `scheme://` prefix is honoured, a leading
    /// `/` means a Unix socket, anything else is TCP with the default
    /// Docker port appended when none is given.
    pub fn parse(host: &str) -> Option<Self> {
        if host.is_empty() {
            return None;
        }
        if let Some((scheme, rest)) = host.split_once("://") {
            return Some(match scheme {
                "unix" => DockerHost::Unix(rest.to_string()),
                _ => DockerHost::Tcp(with_default_port(rest)),
            });
        }
        if host.starts_with('/') {
            return Some(DockerHost::Unix(host.to_string()));
        }
        Some(DockerHost::Tcp(with_default_port(host)))
    }
}

fn with_default_port(addr: &str) -> String {
    let has_port = match (addr.rfind(':'), addr.rfind(']')) {
        (Some(colon), Some(bracket)) => colon > bracket,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if has_port {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_DOCKER_PORT}")
    }
}

/// Minimal client for `GET http://docker/containers/json`.
#[derive(Debug, Clone)]
pub struct DockerClient {
    host: Option<DockerHost>,
}

impl DockerClient {
    /// Create a client; `None` disables listing entirely.
    pub fn new(host: Option<DockerHost>) -> Self {
        Self { host }
    }

    /// Whether a host is configured.
    pub fn is_configured(&self) -> bool {
        self.host.is_some()
    }

    /// List the local containers. Returns an empty list when no host is
    /// configured.
    pub async fn list_containers(&self) -> Result<Vec<Container>, Error> {
        match &self.host {
            None => Ok(Vec::new()),
            Some(host) => self.get_json(host, "/containers/json").await,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        host: &DockerHost,
        path: &str,
    ) -> Result<T, Error> {
        let request = Request::builder()
            .uri(path)
            .header(HOST, "docker")
            .body(Empty::<Bytes>::new())?;

        let response = match host {
            DockerHost::Unix(socket_path) => {
                let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(socket_path))
                    .await
                    .map_err(|_| Error::Timeout("container endpoint dial"))??;
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
                tokio::spawn(conn);
                tokio::time::timeout(RESPONSE_TIMEOUT, sender.send_request(request))
                    .await
                    .map_err(|_| Error::Timeout("container endpoint response"))??
            }
            DockerHost::Tcp(addr) => {
                let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .map_err(|_| Error::Timeout("container endpoint dial"))??;
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
                tokio::spawn(conn);
                tokio::time::timeout(RESPONSE_TIMEOUT, sender.send_request(request))
                    .await
                    .map_err(|_| Error::Timeout("container endpoint response"))??
            }
        };

        if response.status() != StatusCode::OK {
            // reqwest re-exports the same http::StatusCode hyper uses.
            return Err(Error::UnexpectedStatus {
                url: format!("http://docker{path}"),
                status: response.status(),
            });
        }

        let body = response.collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Build the `ip address -> image names` map from a container listing.
pub fn label_containers(containers: &[Container]) -> HashMap<String, Vec<String>> {
    let mut labels: HashMap<String, Vec<String>> = HashMap::new();
    for container in containers {
        for network in container.network_settings.networks.values() {
            let ip = network.address();
            if ip.is_empty() {
                continue;
            }
            labels
                .entry(ip.to_string())
                .or_default()
                .push(container.image.name().to_string());
        }
    }
    labels
}

/// One container from `/containers/json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Container {
    /// The container's image reference.
    #[serde(rename = "Image", default)]
    pub image: ImageRef,
    /// The container's network attachments.
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
}

/// The `NetworkSettings` object of a container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    /// Per-network attachment details, keyed by network name.
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, Network>,
}

/// One network attachment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Network {
    /// Static address configuration, when present.
    #[serde(rename = "IPAMConfig", default)]
    pub ipam_config: Option<IpamConfig>,
    /// The runtime-assigned address.
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

impl Network {
    /// The attachment's address: the runtime address when assigned,
    /// otherwise the static IPv4 then IPv6 configuration.
    fn address(&self) -> &str {
        if !self.ip_address.is_empty() {
            return &self.ip_address;
        }
        if let Some(ipam) = &self.ipam_config {
            if !ipam.ipv4_address.is_empty() {
                return &ipam.ipv4_address;
            }
            if !ipam.ipv6_address.is_empty() {
                return &ipam.ipv6_address;
            }
        }
        ""
    }
}

/// Static address configuration of a network attachment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpamConfig {
    /// Configured IPv4 address.
    #[serde(rename = "IPv4Address", default)]
    pub ipv4_address: String,
    /// Configured IPv6 address.
    #[serde(rename = "IPv6Address", default)]
    pub ipv6_address: String,
}

/// An image reference of the form `[repo/]name[:version]`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ImageRef(pub String);

impl ImageRef {
    /// The repository part, empty when absent.
    pub fn repo(&self) -> &str {
        self.parts().0
    }

    /// The bare image name.
    pub fn name(&self) -> &str {
        self.parts().1
    }

    /// The version part, empty when absent.
    pub fn version(&self) -> &str {
        self.parts().2
    }

    /// Split into `(repo, name, version)`.
    pub fn parts(&self) -> (&str, &str, &str) {
        let s = self.0.as_str();
        let (name, version) = match s.rfind(':') {
            Some(i) => (&s[..i], &s[i + 1..]),
            None => (s, ""),
        };
        let (repo, name) = match name.rfind('/') {
            Some(i) => (&name[..i], &name[i + 1..]),
            None => ("", name),
        };
        (repo, name, version)
    }
}
