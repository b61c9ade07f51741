//! elbsync daemon entry point.
//!
//! Keeps the listeners of a classic ELB in step with the ports published on
//! a Docker swarm, either by full resync on an interval (`poll` mode) or by
//! reacting to container start/kill events (`events` mode).

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

mod collector;
mod config;
mod dispatch;
mod elb;
mod error;
mod mutator;
mod poll;
mod reconciler;
mod runtime;
#[cfg(test)]
mod testing;
mod types;

use config::{Config, Mode};
use dispatch::WorkerContext;
use elb::{AwsLoadBalancer, LoadBalancerApi};
use error::SyncError;
use mutator::Mutator;
use poll::PollScheduler;
use runtime::{ClusterRuntime, DockerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let cfg = Arc::new(Config::load()?);

    // Initialize logging
    let level = if cfg.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    info!("Starting elbsync with config: {:?}", cfg);

    let runtime: Arc<dyn ClusterRuntime> = Arc::new(DockerRuntime::connect()?);
    let api: Arc<dyn LoadBalancerApi> =
        Arc::new(AwsLoadBalancer::from_env(cfg.region.clone()).await);
    let mutator = Mutator::new(Arc::clone(&api), cfg.mutation_delay());

    match cfg.mode {
        Mode::Poll => run_poll(&cfg, runtime, api, mutator).await?,
        Mode::Events => run_events(&cfg, runtime, mutator).await?,
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn run_poll(
    cfg: &Config,
    runtime: Arc<dyn ClusterRuntime>,
    api: Arc<dyn LoadBalancerApi>,
    mutator: Mutator,
) -> Result<(), SyncError> {
    let load_balancer = cfg.default_load_balancer()?.to_string();
    let poller = PollScheduler::new(runtime, api, mutator, load_balancer, cfg.poll_interval());

    poller.run(shutdown_signal()).await
}

async fn run_events(
    cfg: &Arc<Config>,
    runtime: Arc<dyn ClusterRuntime>,
    mutator: Mutator,
) -> Result<(), SyncError> {
    let ctx = Arc::new(WorkerContext {
        runtime,
        mutator,
        config: Arc::clone(cfg),
    });
    dispatch::run(ctx, shutdown_signal()).await
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    }
}
