//! Load balancer access.
//!
//! The controllers only ever need three calls against one named load
//! balancer: describe its listeners, add a TCP listener, drop a listener
//! by port.  [`LoadBalancerApi`] is that surface; [`aws::AwsLoadBalancer`]
//! implements it against the classic Elastic Load Balancing API.

use crate::error::SyncError;
use crate::types::ListenerKey;
use async_trait::async_trait;

pub mod aws;
pub use aws::AwsLoadBalancer;

/// A configured listener as the load balancer reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDescription {
    pub protocol: String,
    pub load_balancer_port: i32,
    pub instance_protocol: Option<String>,
    pub instance_port: i32,
}

#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Fails with [`SyncError::LoadBalancerNotFound`] when the name does not
    /// resolve.
    async fn describe_listeners(
        &self,
        load_balancer: &str,
    ) -> Result<Vec<ListenerDescription>, SyncError>;

    /// Adds a listener forwarding `key.port` to the same port on the
    /// instances.  May fail with [`SyncError::ListenerExists`].
    async fn create_listener(&self, load_balancer: &str, key: ListenerKey)
        -> Result<(), SyncError>;

    /// Removes the listener on `port`.  May fail with
    /// [`SyncError::ListenerNotFound`].
    async fn delete_listener(&self, load_balancer: &str, port: u16) -> Result<(), SyncError>;
}
