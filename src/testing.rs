//! In-memory fakes of the cluster and the load balancer for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::elb::{ListenerDescription, LoadBalancerApi};
use crate::error::SyncError;
use crate::runtime::ClusterRuntime;
use crate::types::{ClusterEvent, ListenerKey, PortMapping};

pub fn mapping(host_ip: Option<&str>, port: Option<&str>, protocol: &str) -> PortMapping {
    PortMapping {
        host_ip: host_ip.map(Into::into),
        published_port: port.map(Into::into),
        protocol: protocol.into(),
    }
}

pub fn container_event(action: &str, id: &str) -> ClusterEvent {
    ClusterEvent {
        scope: "container".into(),
        action: action.into(),
        id: Some(id.into()),
    }
}

#[derive(Default)]
pub struct FakeCluster {
    services: Vec<PortMapping>,
    containers: HashMap<String, Vec<PortMapping>>,
    /// `None` makes the leadership query fail.
    leader: Option<bool>,
    fatal_containers: HashSet<String>,
    panicking_containers: HashSet<String>,
    /// One entry per subscription, handed out in order.
    events: Mutex<VecDeque<Vec<Result<ClusterEvent, SyncError>>>>,
    pub subscriptions: AtomicUsize,
    pub service_calls: AtomicUsize,
    pub container_calls: AtomicUsize,
    pub leader_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn with_services(mut self, mappings: Vec<PortMapping>) -> Self {
        self.services = mappings;
        self
    }

    pub fn with_container(mut self, id: &str, mappings: Vec<PortMapping>) -> Self {
        self.containers.insert(id.to_string(), mappings);
        self
    }

    /// Inspecting this container fails with a fatal error.
    pub fn with_fatal_container(mut self, id: &str) -> Self {
        self.fatal_containers.insert(id.to_string());
        self
    }

    /// Inspecting this container panics.
    pub fn with_panicking_container(mut self, id: &str) -> Self {
        self.panicking_containers.insert(id.to_string());
        self
    }

    pub fn with_leader(mut self, leader: Option<bool>) -> Self {
        self.leader = leader;
        self
    }

    pub fn with_events(self, events: Vec<ClusterEvent>) -> Self {
        self.with_subscription(events.into_iter().map(Ok).collect())
    }

    pub fn with_subscription(self, events: Vec<Result<ClusterEvent, SyncError>>) -> Self {
        self.events.lock().unwrap().push_back(events);
        self
    }
}

#[async_trait]
impl ClusterRuntime for FakeCluster {
    async fn service_ports(&self) -> Result<Vec<PortMapping>, SyncError> {
        self.service_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.services.clone())
    }

    async fn container_ports(&self, container_id: &str) -> Result<Vec<PortMapping>, SyncError> {
        self.container_calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal_containers.contains(container_id) {
            return Err(SyncError::Fatal(format!("inspect {container_id} denied")));
        }
        if self.panicking_containers.contains(container_id) {
            panic!("inspect {container_id} blew up");
        }
        tokio::task::yield_now().await;
        self.containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| SyncError::ContainerNotFound(container_id.to_string()))
    }

    async fn is_leader(&self) -> Result<bool, SyncError> {
        self.leader_calls.fetch_add(1, Ordering::SeqCst);
        self.leader
            .ok_or_else(|| SyncError::Remote("swarm unreachable".into()))
    }

    /// Each subscription takes the next seeded batch; once they run out
    /// subscriptions are empty.
    fn events(&self) -> BoxStream<'static, Result<ClusterEvent, SyncError>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let events = self.events.lock().unwrap().pop_front().unwrap_or_default();
        stream::iter(events).boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Describe,
    Create(u16),
    Delete(u16),
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Transient,
    Fatal,
}

/// A single named load balancer that reports duplicate creates and
/// missing deletes the way the real API can.
pub struct FakeLoadBalancer {
    name: String,
    listeners: Mutex<BTreeMap<i32, ListenerDescription>>,
    failures: Mutex<HashMap<u16, Failure>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeLoadBalancer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            listeners: Mutex::default(),
            failures: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    pub fn seed(&self, ports: &[u16]) {
        for port in ports {
            self.seed_raw(tcp_description(*port));
        }
    }

    pub fn seed_raw(&self, listener: ListenerDescription) {
        self.listeners
            .lock()
            .unwrap()
            .insert(listener.load_balancer_port, listener);
    }

    pub fn fail(&self, port: u16, failure: Failure) {
        self.failures.lock().unwrap().insert(port, failure);
    }

    pub fn ports(&self) -> Vec<i32> {
        self.listeners.lock().unwrap().keys().copied().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| *c != Call::Describe)
            .collect()
    }

    fn check(&self, load_balancer: &str, port: u16) -> Result<(), SyncError> {
        if load_balancer != self.name {
            return Err(SyncError::LoadBalancerNotFound(load_balancer.to_string()));
        }
        match self.failures.lock().unwrap().get(&port) {
            Some(Failure::Transient) => Err(SyncError::Remote("Throttling".into())),
            Some(Failure::Fatal) => Err(SyncError::Fatal("InvalidClientTokenId".into())),
            None => Ok(()),
        }
    }
}

fn tcp_description(port: u16) -> ListenerDescription {
    ListenerDescription {
        protocol: "TCP".into(),
        load_balancer_port: i32::from(port),
        instance_protocol: Some("TCP".into()),
        instance_port: i32::from(port),
    }
}

#[async_trait]
impl LoadBalancerApi for FakeLoadBalancer {
    async fn describe_listeners(
        &self,
        load_balancer: &str,
    ) -> Result<Vec<ListenerDescription>, SyncError> {
        self.calls.lock().unwrap().push(Call::Describe);
        if load_balancer != self.name {
            return Err(SyncError::LoadBalancerNotFound(load_balancer.to_string()));
        }
        Ok(self.listeners.lock().unwrap().values().cloned().collect())
    }

    async fn create_listener(
        &self,
        load_balancer: &str,
        key: ListenerKey,
    ) -> Result<(), SyncError> {
        self.calls.lock().unwrap().push(Call::Create(key.port));
        self.check(load_balancer, key.port)?;
        tokio::task::yield_now().await;

        let mut listeners = self.listeners.lock().unwrap();
        if listeners.contains_key(&i32::from(key.port)) {
            return Err(SyncError::ListenerExists {
                load_balancer: load_balancer.to_string(),
                port: key.port,
            });
        }
        listeners.insert(i32::from(key.port), tcp_description(key.port));
        Ok(())
    }

    async fn delete_listener(&self, load_balancer: &str, port: u16) -> Result<(), SyncError> {
        self.calls.lock().unwrap().push(Call::Delete(port));
        self.check(load_balancer, port)?;
        tokio::task::yield_now().await;

        match self.listeners.lock().unwrap().remove(&i32::from(port)) {
            Some(_) => Ok(()),
            None => Err(SyncError::ListenerNotFound {
                load_balancer: load_balancer.to_string(),
                port,
            }),
        }
    }
}
