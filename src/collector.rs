//! Desired and live state collection.
//!
//! Both sides are reduced to sets of [`ListenerKey`] so the reconciler can
//! diff them directly.  Malformed records are skipped with a log line; they
//! never fail the whole collection.

use std::collections::BTreeSet;

use log::{debug, warn};

use crate::elb::LoadBalancerApi;
use crate::error::SyncError;
use crate::runtime::ClusterRuntime;
use crate::types::{ListenerKey, ListenerTarget, PortMapping};

/// Listener keys for every ingress-published port of every service.
pub async fn desired_from_services(
    runtime: &dyn ClusterRuntime,
) -> Result<BTreeSet<ListenerKey>, SyncError> {
    let mappings = runtime.service_ports().await?;
    Ok(valid_targets(&mappings)
        .into_iter()
        .map(|target| target.key)
        .collect())
}

/// Listener targets for one container's published ports.
pub async fn desired_for_container(
    runtime: &dyn ClusterRuntime,
    container_id: &str,
) -> Result<BTreeSet<ListenerTarget>, SyncError> {
    let mappings = runtime.container_ports(container_id).await?;
    Ok(valid_targets(&mappings))
}

/// TCP listeners currently configured on `load_balancer`.
pub async fn live_listeners(
    api: &dyn LoadBalancerApi,
    load_balancer: &str,
) -> Result<BTreeSet<ListenerKey>, SyncError> {
    let listeners = api.describe_listeners(load_balancer).await?;

    let mut keys = BTreeSet::new();
    for listener in listeners {
        match ListenerKey::from_raw(&listener.load_balancer_port.to_string(), &listener.protocol) {
            Ok(key) => {
                keys.insert(key);
            }
            Err(SyncError::UnsupportedProtocol(protocol)) => {
                debug!(
                    "Ignoring {} listener {} -> {:?}/{} on {}",
                    protocol,
                    listener.load_balancer_port,
                    listener.instance_protocol,
                    listener.instance_port,
                    load_balancer
                );
            }
            Err(e) => warn!("Skipping listener on {}: {}", load_balancer, e),
        }
    }
    Ok(keys)
}

fn valid_targets(mappings: &[PortMapping]) -> BTreeSet<ListenerTarget> {
    let mut targets = BTreeSet::new();
    for mapping in mappings {
        match mapping.listener_key() {
            Ok(Some(key)) => {
                targets.insert(ListenerTarget {
                    key,
                    host_ip: mapping.host_ip.clone(),
                });
            }
            Ok(None) => {}
            Err(SyncError::UnsupportedProtocol(protocol)) => {
                debug!("Ignoring {} mapping {:?}", protocol, mapping.published_port);
            }
            Err(e) => warn!("Skipping port mapping: {}", e),
        }
    }
    targets
}
