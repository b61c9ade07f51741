//! Full-sync controller.
//!
//! On every tick the leader recomputes the desired listener set from all
//! swarm services, reads the live set from the load balancer and applies
//! the difference.  Non-leaders skip the tick without touching either API.
//! Leadership is re-read every tick, so a handover is picked up within one
//! interval.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::{interval, MissedTickBehavior};

use crate::collector::{desired_from_services, live_listeners};
use crate::elb::LoadBalancerApi;
use crate::error::SyncError;
use crate::mutator::{ApplyReport, Mutator};
use crate::reconciler::Plan;
use crate::runtime::ClusterRuntime;

/// What a single poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    NotLeader,
    Reconciled(ApplyReport),
    /// The pass failed with a recoverable error; retried next tick.
    Failed,
}

pub struct PollScheduler {
    runtime: Arc<dyn ClusterRuntime>,
    api: Arc<dyn LoadBalancerApi>,
    mutator: Mutator,
    load_balancer: String,
    interval: Duration,
}

impl PollScheduler {
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        api: Arc<dyn LoadBalancerApi>,
        mutator: Mutator,
        load_balancer: String,
        interval: Duration,
    ) -> Self {
        Self {
            runtime,
            api,
            mutator,
            load_balancer,
            interval,
        }
    }

    /// Runs cycles until `shutdown` resolves or a fatal error occurs.  A
    /// cycle in progress is always finished before shutting down.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Polling every {:?}, target load balancer {}",
            self.interval, self.load_balancer
        );
        tokio::pin!(shutdown);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => return Ok(()),
            }
            self.cycle().await?;
        }
    }

    /// One leadership check plus, if leader, one full reconciliation.
    pub async fn cycle(&self) -> Result<Cycle, SyncError> {
        match self.runtime.is_leader().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Node is not a Leader");
                return Ok(Cycle::NotLeader);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Could not determine swarm leadership, skipping cycle: {}", e);
                return Ok(Cycle::Failed);
            }
        }

        match self.reconcile().await {
            Ok(report) => Ok(Cycle::Reconciled(report)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("Reconciliation of {} failed: {}", self.load_balancer, e);
                Ok(Cycle::Failed)
            }
        }
    }

    async fn reconcile(&self) -> Result<ApplyReport, SyncError> {
        let desired = desired_from_services(self.runtime.as_ref()).await?;
        debug!("CurrentServices: {:?}", desired);

        let live = live_listeners(self.api.as_ref(), &self.load_balancer).await?;
        debug!("CurrentListeners: {:?}", live);

        let plan = Plan::compute(&desired, &live);
        if plan.is_empty() {
            debug!("{} is up to date", self.load_balancer);
            return Ok(ApplyReport::default());
        }
        self.mutator.apply(&self.load_balancer, &plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mapping, Call, FakeCluster, FakeLoadBalancer, Failure};
    use std::sync::atomic::Ordering;

    const DELAY: Duration = Duration::from_millis(200);

    fn scheduler(cluster: &Arc<FakeCluster>, lb: &Arc<FakeLoadBalancer>, name: &str) -> PollScheduler {
        PollScheduler::new(
            cluster.clone(),
            lb.clone(),
            Mutator::new(lb.clone(), DELAY),
            name.to_string(),
            Duration::from_secs(3),
        )
    }

    fn services(ports: &[&str]) -> Vec<crate::types::PortMapping> {
        ports.iter().map(|p| mapping(None, Some(*p), "tcp")).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn non_leader_touches_nothing() {
        let cluster = Arc::new(
            FakeCluster::default()
                .with_leader(Some(false))
                .with_services(services(&["80"])),
        );
        let lb = Arc::new(FakeLoadBalancer::new("edge"));

        let cycle = scheduler(&cluster, &lb, "edge").cycle().await.unwrap();
        assert_eq!(cycle, Cycle::NotLeader);
        assert_eq!(cluster.leader_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.service_calls.load(Ordering::SeqCst), 0);
        assert!(lb.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leader_reconciles_bulk_state() {
        let cluster = Arc::new(
            FakeCluster::default()
                .with_leader(Some(true))
                .with_services(services(&["80", "443"])),
        );
        let lb = Arc::new(FakeLoadBalancer::new("edge"));
        lb.seed(&[443, 8080]);
        let poller = scheduler(&cluster, &lb, "edge");

        let cycle = poller.cycle().await.unwrap();
        assert_eq!(
            cycle,
            Cycle::Reconciled(ApplyReport {
                created: 1,
                removed: 1,
                failed: 0
            })
        );
        assert_eq!(lb.mutations(), vec![Call::Delete(8080), Call::Create(80)]);
        assert_eq!(lb.ports(), vec![80, 443]);

        // A second pass over unchanged state changes nothing.
        let cycle = poller.cycle().await.unwrap();
        assert_eq!(cycle, Cycle::Reconciled(ApplyReport::default()));
        assert_eq!(lb.mutations().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_load_balancer_skips_the_cycle() {
        let cluster = Arc::new(
            FakeCluster::default()
                .with_leader(Some(true))
                .with_services(services(&["80"])),
        );
        let lb = Arc::new(FakeLoadBalancer::new("edge"));

        let cycle = scheduler(&cluster, &lb, "missing").cycle().await.unwrap();
        assert_eq!(cycle, Cycle::Failed);
        assert!(lb.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_leadership_source_skips_the_cycle() {
        let cluster = Arc::new(FakeCluster::default().with_leader(None));
        let lb = Arc::new(FakeLoadBalancer::new("edge"));

        let cycle = scheduler(&cluster, &lb, "edge").cycle().await.unwrap();
        assert_eq!(cycle, Cycle::Failed);
        assert_eq!(cluster.service_calls.load(Ordering::SeqCst), 0);
        assert!(lb.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_the_loop() {
        let cluster = Arc::new(
            FakeCluster::default()
                .with_leader(Some(true))
                .with_services(services(&["80"])),
        );
        let lb = Arc::new(FakeLoadBalancer::new("edge"));
        lb.fail(80, Failure::Fatal);

        let err = scheduler(&cluster, &lb, "edge")
            .run(std::future::pending())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn run_rechecks_leadership_every_interval() {
        let cluster = Arc::new(FakeCluster::default().with_leader(Some(false)));
        let lb = Arc::new(FakeLoadBalancer::new("edge"));
        let poller = scheduler(&cluster, &lb, "edge");

        poller
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await
            .unwrap();
        // Ticks at 0s, 3s, 6s and 9s.
        assert_eq!(cluster.leader_calls.load(Ordering::SeqCst), 4);
        assert!(lb.calls().is_empty());
    }
}
