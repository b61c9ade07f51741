use crate::error::SyncError;
use crate::types::{ClusterEvent, PortMapping};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub mod docker;
pub use docker::DockerRuntime;

/// Read access to the container cluster.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Published endpoint ports of every service in the cluster.
    async fn service_ports(&self) -> Result<Vec<PortMapping>, SyncError>;

    /// Published port bindings of one container.  Fails with
    /// [`SyncError::ContainerNotFound`] when the container is gone.
    async fn container_ports(&self, container_id: &str) -> Result<Vec<PortMapping>, SyncError>;

    /// Whether this node is currently the cluster's elected leader.
    async fn is_leader(&self) -> Result<bool, SyncError>;

    /// Subscribe to container lifecycle notifications.  The stream ends or
    /// yields an error when the subscription drops.
    fn events(&self) -> BoxStream<'static, Result<ClusterEvent, SyncError>>;
}
