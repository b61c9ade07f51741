//! Rate-limited listener mutation.
//!
//! Every mutating call is followed by a fixed delay before the caller may
//! issue the next one.  The delay is per caller: each worker and each poll
//! pass pays its own.  Not-found / already-exists races are reported as
//! [`Outcome::AlreadyDone`] instead of errors.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;

use crate::elb::LoadBalancerApi;
use crate::error::SyncError;
use crate::reconciler::Plan;
use crate::types::ListenerKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The listener was already in the requested state.
    AlreadyDone,
}

/// Counts from applying one [`Plan`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Mutator {
    api: Arc<dyn LoadBalancerApi>,
    delay: Duration,
}

impl Mutator {
    pub fn new(api: Arc<dyn LoadBalancerApi>, delay: Duration) -> Self {
        Self { api, delay }
    }

    pub async fn create_listener(
        &self,
        load_balancer: &str,
        key: ListenerKey,
    ) -> Result<Outcome, SyncError> {
        let result = self.api.create_listener(load_balancer, key).await;
        sleep(self.delay).await;
        settle(result)
    }

    pub async fn remove_listener(
        &self,
        load_balancer: &str,
        key: ListenerKey,
    ) -> Result<Outcome, SyncError> {
        let result = self.api.delete_listener(load_balancer, key.port).await;
        sleep(self.delay).await;
        settle(result)
    }

    /// Applies a plan: stale listeners are removed before missing ones are
    /// created.  A transient failure on one listener does not stop the rest;
    /// a fatal error or a vanished load balancer aborts the pass.
    pub async fn apply(&self, load_balancer: &str, plan: &Plan) -> Result<ApplyReport, SyncError> {
        let mut report = ApplyReport::default();

        if !plan.to_remove.is_empty() {
            info!(
                "Starting to delete unnecessary listeners on ELB: {} ({} in total).",
                load_balancer,
                plan.to_remove.len()
            );
            debug!("ToDelete: {:?}", plan.to_remove);
            for key in &plan.to_remove {
                match self.remove_listener(load_balancer, *key).await {
                    Ok(_) => report.removed += 1,
                    Err(e) => abort_or_count(e, "remove", load_balancer, *key, &mut report)?,
                }
            }
            info!("All unnecessary listeners deleted.");
        }

        if !plan.to_create.is_empty() {
            info!(
                "Starting to create missing listeners on ELB: {} ({} in total).",
                load_balancer,
                plan.to_create.len()
            );
            debug!("ToCreate: {:?}", plan.to_create);
            for key in &plan.to_create {
                match self.create_listener(load_balancer, *key).await {
                    Ok(_) => report.created += 1,
                    Err(e) => abort_or_count(e, "create", load_balancer, *key, &mut report)?,
                }
            }
            info!("All missing listeners created.");
        }

        Ok(report)
    }
}

fn settle(result: Result<(), SyncError>) -> Result<Outcome, SyncError> {
    match result {
        Ok(()) => Ok(Outcome::Applied),
        Err(e) if e.is_race() => {
            debug!("{}; nothing to do", e);
            Ok(Outcome::AlreadyDone)
        }
        Err(e) => Err(e),
    }
}

fn abort_or_count(
    err: SyncError,
    op: &str,
    load_balancer: &str,
    key: ListenerKey,
    report: &mut ApplyReport,
) -> Result<(), SyncError> {
    if err.is_fatal() || matches!(err, SyncError::LoadBalancerNotFound(_)) {
        return Err(err);
    }
    warn!("Failed to {} listener {} on {}: {}", op, key, load_balancer, err);
    report.failed += 1;
    Ok(())
}
