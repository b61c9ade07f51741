//! Event-driven controller.
//!
//! One ingestion task subscribes to the cluster event stream and pushes
//! container `start`/`kill` notifications onto a bounded FIFO queue.  A
//! fixed pool of workers drains it; each resolves the container's
//! published ports and creates or removes the matching listeners.
//!
//! Nothing pins a container to a worker, so two workers may handle events
//! for the same container at once.  That is safe because listener
//! mutations tolerate already-exists / not-found races.
//!
//! A full queue blocks the producer rather than dropping events: a lost
//! `kill` would leak a listener.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::collector::desired_for_container;
use crate::config::Config;
use crate::error::SyncError;
use crate::mutator::Mutator;
use crate::runtime::ClusterRuntime;
use crate::types::{Action, ClusterEvent, WorkItem};

/// Items pushed but not yet finished by a worker.
#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Creates a bounded work queue.  The queue closes once every producer
/// has been dropped and the remaining items are drained.
pub fn work_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    let pending = Arc::new(Pending::default());
    (
        QueueProducer {
            tx,
            pending: Arc::clone(&pending),
        },
        QueueConsumer {
            rx: Arc::new(Mutex::new(rx)),
            pending,
        },
    )
}

#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<WorkItem>,
    pending: Arc<Pending>,
}

impl QueueProducer {
    /// Enqueues an item, waiting while the queue is full.  Cancelling the
    /// wait leaves the queue untouched.
    pub async fn push(&self, item: WorkItem) -> Result<(), SyncError> {
        let permit = self.tx.reserve().await.map_err(|_| SyncError::QueueClosed)?;
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        permit.send(item);
        Ok(())
    }
}

#[derive(Clone)]
pub struct QueueConsumer {
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    pending: Arc<Pending>,
}

impl QueueConsumer {
    /// Takes the next item, waiting while the queue is empty.  `None` once
    /// the queue is closed and drained.
    async fn pop(&self) -> Option<WorkItem> {
        self.rx.lock().await.recv().await
    }

    /// Guard for one popped item; it counts as finished once the guard is
    /// dropped, even if the worker unwinds.
    fn track(&self) -> Finished<'_> {
        Finished(&self.pending)
    }

    /// Waits until every item pushed so far has been applied or dropped.
    pub async fn join(&self) {
        self.pending.wait_idle().await;
    }
}

struct Finished<'a>(&'a Pending);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Forwards one event subscription into the queue until the stream ends
/// or errors.  Returns the number of items enqueued.
pub async fn pump(
    mut events: BoxStream<'static, Result<ClusterEvent, SyncError>>,
    producer: &QueueProducer,
) -> Result<usize, SyncError> {
    let mut enqueued = 0;
    while let Some(msg) = events.next().await {
        match msg {
            Ok(event) => match WorkItem::from_event(&event) {
                Some(item) => {
                    debug!("Container event: {} for {}", item.action, item.container_id);
                    producer.push(item).await?;
                    enqueued += 1;
                }
                None => trace!("Ignoring {} {} event", event.scope, event.action),
            },
            Err(e) => {
                error!("Error in Docker event stream: {}", e);
                break;
            }
        }
    }
    Ok(enqueued)
}

/// Subscribes to the cluster event stream forever, re-subscribing after
/// `reconnect` whenever the subscription drops.  Only returns if the queue
/// has been closed.
pub async fn ingest(
    runtime: Arc<dyn ClusterRuntime>,
    producer: QueueProducer,
    reconnect: Duration,
) -> Result<(), SyncError> {
    loop {
        info!("Listening for Docker events...");
        pump(runtime.events(), &producer).await?;
        warn!("Docker event stream ended. Reconnecting in {:?}...", reconnect);
        sleep(reconnect).await;
    }
}

/// Shared, read-only dependencies of every worker.
pub struct WorkerContext {
    pub runtime: Arc<dyn ClusterRuntime>,
    pub mutator: Mutator,
    pub config: Arc<Config>,
}

/// Applies one work item.  Returns the number of listeners touched.
async fn handle(worker: &str, item: &WorkItem, ctx: &WorkerContext) -> Result<usize, SyncError> {
    let targets = desired_for_container(ctx.runtime.as_ref(), &item.container_id).await?;
    if targets.is_empty() {
        debug!(
            "{}: container {} has no published ports",
            worker, item.container_id
        );
    }

    let mut touched = 0;
    for target in targets {
        let load_balancer = match ctx.config.load_balancer_for(target.host_ip.as_deref()) {
            Ok(name) => name,
            Err(e) => {
                error!(
                    "{}: container {} {} {}: {}",
                    worker, item.container_id, item.action, target.key, e
                );
                continue;
            }
        };
        debug!(
            "{}: container {} action {} mapping {} via {:?}",
            worker, item.container_id, item.action, target.key, target.host_ip
        );

        match item.action {
            Action::Start => {
                info!("{}: adding port {} to {}", worker, target.key.port, load_balancer);
                ctx.mutator.create_listener(load_balancer, target.key).await?;
            }
            Action::Kill => {
                info!("{}: removing port {} from {}", worker, target.key.port, load_balancer);
                ctx.mutator.remove_listener(load_balancer, target.key).await?;
            }
        }
        touched += 1;
    }
    Ok(touched)
}

async fn run_worker(
    id: usize,
    consumer: QueueConsumer,
    ctx: Arc<WorkerContext>,
) -> Result<(), SyncError> {
    let worker = format!("worker-{id}");
    debug!("Starting {}", worker);

    while let Some(item) = consumer.pop().await {
        let finished = consumer.track();
        let result = handle(&worker, &item, &ctx).await;
        drop(finished);

        match result {
            Ok(touched) => debug!(
                "{}: {} {} applied ({} listeners)",
                worker, item.action, item.container_id, touched
            ),
            Err(e) if e.is_fatal() => {
                error!(
                    "{}: {} {} failed: {}",
                    worker, item.action, item.container_id, e
                );
                return Err(e);
            }
            Err(SyncError::ContainerNotFound(id)) => {
                info!("{}: container {} is gone, dropping {}", worker, id, item.action)
            }
            Err(e) => warn!(
                "{}: dropping {} {}: {}",
                worker, item.action, item.container_id, e
            ),
        }
    }

    debug!("{} stopping, queue closed", worker);
    Ok(())
}

/// A fixed set of worker tasks draining one queue.
pub struct WorkerPool {
    workers: JoinSet<Result<(), SyncError>>,
    consumer: QueueConsumer,
}

impl WorkerPool {
    pub fn start(size: usize, consumer: QueueConsumer, ctx: Arc<WorkerContext>) -> Self {
        let mut workers = JoinSet::new();
        for id in 0..size.max(1) {
            workers.spawn(run_worker(id, consumer.clone(), Arc::clone(&ctx)));
        }
        info!("Started {} workers", size.max(1));
        Self { workers, consumer }
    }

    /// Waits for workers to finish.  Returns the first fatal worker error,
    /// or `Ok` once all workers have exited because the queue closed.
    pub async fn supervise(&mut self) -> Result<(), SyncError> {
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(SyncError::WorkerPanicked(e.to_string())),
            }
        }
        Ok(())
    }

    /// Waits for every queued item to be processed, then for the workers
    /// to exit.  Every producer must have been dropped beforehand.  A worker
    /// failing mid-drain ends the wait with its error.
    pub async fn drain(mut self) -> Result<(), SyncError> {
        let consumer = self.consumer.clone();
        let early = tokio::select! {
            result = self.supervise() => Some(result),
            _ = consumer.join() => None,
        };
        match early {
            Some(result) => result,
            None => self.supervise().await,
        }
    }
}

enum Stopped {
    Workers(Result<(), SyncError>),
    Ingestion(Result<(), SyncError>),
    Shutdown,
}

/// Runs the event controller until `shutdown` resolves or a worker fails
/// fatally.  On shutdown ingestion stops first, then everything already
/// queued is applied before returning.
pub async fn run<F>(ctx: Arc<WorkerContext>, shutdown: F) -> Result<(), SyncError>
where
    F: Future<Output = ()>,
{
    let config = Arc::clone(&ctx.config);
    let (producer, consumer) = work_queue(config.queue_capacity());
    let mut pool = WorkerPool::start(config.workers(), consumer, Arc::clone(&ctx));
    let mut ingestion = tokio::spawn(ingest(
        Arc::clone(&ctx.runtime),
        producer,
        config.reconnect_delay(),
    ));
    tokio::pin!(shutdown);

    let stopped = tokio::select! {
        result = pool.supervise() => Stopped::Workers(result),
        joined = &mut ingestion => Stopped::Ingestion(match joined {
            Ok(result) => result,
            Err(e) => Err(SyncError::WorkerPanicked(format!("event ingestion: {}", e))),
        }),
        _ = &mut shutdown => Stopped::Shutdown,
    };

    match stopped {
        Stopped::Workers(result) => {
            ingestion.abort();
            result?;
            warn!("All workers exited");
            Ok(())
        }
        Stopped::Ingestion(result) => {
            error!("Event ingestion stopped");
            result.and(Err(SyncError::QueueClosed))
        }
        Stopped::Shutdown => {
            ingestion.abort();
            // The producer is dropped with the task, which closes the queue.
            let _ = ingestion.await;
            info!("Draining work queue...");
            pool.drain().await
        }
    }
}
