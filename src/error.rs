//! Error taxonomy for both controllers.
//!
//! Errors fall in four classes: transient remote failures, not-found /
//! already-exists races on listener mutation, configuration or data
//! resolution failures, and fatal failures that must stop the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed port mapping {port:?}/{protocol:?}: {reason}")]
    MalformedMapping {
        port: String,
        protocol: String,
        reason: String,
    },

    #[error("unsupported listener protocol {0}")]
    UnsupportedProtocol(String),

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("load balancer {0} not found")]
    LoadBalancerNotFound(String),

    #[error("no load balancer configured for address tag {0:?} and no default")]
    UnknownLoadBalancer(String),

    #[error("listener on port {port} already exists on {load_balancer}")]
    ListenerExists { load_balancer: String, port: u16 },

    #[error("no listener on port {port} of {load_balancer}")]
    ListenerNotFound { load_balancer: String, port: u16 },

    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("load balancer API: {0}")]
    Remote(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("work queue closed")]
    QueueClosed,

    #[error("worker {0} panicked")]
    WorkerPanicked(String),
}

impl SyncError {
    /// Errors after which the process must stop rather than carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_) | SyncError::WorkerPanicked(_))
    }

    /// Mutation races: the desired end state is already reached.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            SyncError::ListenerExists { .. } | SyncError::ListenerNotFound { .. }
        )
    }
}
