use super::ClusterRuntime;
use crate::error::SyncError;
use crate::types::{ClusterEvent, PortMapping};
use async_trait::async_trait;
use bollard::container::InspectContainerOptions;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerInspectResponse, EndpointPortConfig, Node};
use bollard::service::ListServicesOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector};
use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

pub struct DockerRuntime {
    docker: Docker,
    nodes: NodeClient,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon (unix socket on Linux).
    pub fn connect() -> Result<Self, SyncError> {
        let docker = Docker::connect_with_local_defaults()?;
        let nodes = NodeClient::new(socket_path(std::env::var("DOCKER_HOST").ok().as_deref()));
        Ok(Self { docker, nodes })
    }
}

/// bollard 0.17 has no node endpoints, so `GET /nodes/{id}` goes over the
/// daemon socket directly and decodes into bollard's own `Node` model.
struct NodeClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket: Option<PathBuf>,
}

impl NodeClient {
    fn new(socket: Option<PathBuf>) -> Self {
        Self {
            client: Client::unix(),
            socket,
        }
    }

    async fn inspect(&self, node_id: &str) -> Result<Node, SyncError> {
        let Some(socket) = &self.socket else {
            return Err(SyncError::Fatal(
                "swarm leadership can only be read over a unix DOCKER_HOST".into(),
            ));
        };
        if node_id.is_empty() || !node_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SyncError::Remote(format!("malformed swarm node id {:?}", node_id)));
        }

        let uri: hyper::Uri = hyperlocal::Uri::new(socket, &format!("/nodes/{}", node_id)).into();
        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| SyncError::Remote(format!("inspect node {}: {}", node_id, e)))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::Remote(format!("inspect node {}: {}", node_id, e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(SyncError::Remote(format!(
                "inspect node {}: {} {}",
                node_id,
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }
        decode_node(&body)
    }
}

/// Resolves the daemon socket the same way bollard's local defaults do:
/// `unix://` hosts name the socket, an unset host means the default socket,
/// anything else (tcp, ssh) has no socket.
fn socket_path(docker_host: Option<&str>) -> Option<PathBuf> {
    match docker_host.filter(|h| !h.is_empty()) {
        None => Some(PathBuf::from(DEFAULT_SOCKET)),
        Some(host) => host.strip_prefix("unix://").map(PathBuf::from),
    }
}

fn decode_node(body: &[u8]) -> Result<Node, SyncError> {
    serde_json::from_slice(body)
        .map_err(|e| SyncError::Remote(format!("undecodable node description: {}", e)))
}

fn leads(node: &Node) -> bool {
    node.manager_status
        .as_ref()
        .and_then(|m| m.leader)
        .unwrap_or(false)
}

#[async_trait]
impl ClusterRuntime for DockerRuntime {
    async fn service_ports(&self) -> Result<Vec<PortMapping>, SyncError> {
        let services = self
            .docker
            .list_services(None::<ListServicesOptions<String>>)
            .await?;
        debug!("Found {} swarm services", services.len());

        Ok(services
            .iter()
            .filter_map(|s| s.endpoint.as_ref())
            .filter_map(|e| e.ports.as_ref())
            .flatten()
            .map(endpoint_port_mapping)
            .collect())
    }

    async fn container_ports(&self, container_id: &str) -> Result<Vec<PortMapping>, SyncError> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => Ok(container_port_mappings(&detail)),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(SyncError::ContainerNotFound(container_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_leader(&self) -> Result<bool, SyncError> {
        let info = self.docker.info().await?;
        let node_id = match info.swarm.and_then(|s| s.node_id).filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                debug!("Docker daemon is not part of a swarm");
                return Ok(false);
            }
        };

        let node = self.nodes.inspect(&node_id).await?;
        Ok(leads(&node))
    }

    fn events(&self) -> BoxStream<'static, Result<ClusterEvent, SyncError>> {
        let opts = EventsOptions::<String> {
            filters: [
                ("type", ["container"].as_slice()),
                ("event", ["start", "kill"].as_slice()),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect(),
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .map(|msg| -> Result<ClusterEvent, SyncError> {
                let event = msg?;
                Ok(ClusterEvent {
                    scope: event.typ.map(|t| t.to_string()).unwrap_or_default(),
                    action: event.action.unwrap_or_default(),
                    id: event.actor.and_then(|a| a.id),
                })
            })
            .boxed()
    }
}

fn endpoint_port_mapping(port: &EndpointPortConfig) -> PortMapping {
    PortMapping {
        host_ip: None,
        published_port: port.published_port.map(|p| p.to_string()),
        protocol: port
            .protocol
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "tcp".to_string()),
    }
}

/// Flattens `{"5000/tcp": [{HostIp, HostPort}, ...]}` into mappings,
/// skipping ports that are exposed but not bound.
fn container_port_mappings(detail: &ContainerInspectResponse) -> Vec<PortMapping> {
    let empty = HashMap::new();
    let ports = detail
        .network_settings
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .unwrap_or(&empty);

    let mut mappings = Vec::new();
    for (exposed, bindings) in ports {
        let protocol = exposed.split_once('/').map_or("tcp", |(_, proto)| proto);
        for binding in bindings.iter().flatten() {
            mappings.push(PortMapping {
                host_ip: binding.host_ip.clone().filter(|ip| !ip.is_empty()),
                published_port: binding.host_port.clone(),
                protocol: protocol.to_string(),
            });
        }
    }
    mappings
}
