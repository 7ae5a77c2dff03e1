use std::sync::Arc;

use error_stack::Report;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{event, instrument, Level};

use crate::{
    ClusterError, ClusterHandle, PublishedScheduler, Role, SchedulerRole, VmInterface, WorkerRole,
};

/// Creates the roles for a cluster. Implement this for each provider.
pub trait InstanceFactory: Send + Sync {
    type Scheduler: VmInterface + 'static;
    type Worker: VmInterface + 'static;

    /// Create the scheduler role for the cluster.
    fn scheduler(
        &self,
        cluster: &ClusterHandle,
    ) -> Result<SchedulerRole<Self::Scheduler>, Report<ClusterError>>;

    /// Create a worker role. This is only called after the scheduler has published its
    /// addresses on the cluster. `ordinal` is unique among the workers of a cluster.
    fn worker(
        &self,
        cluster: &ClusterHandle,
        ordinal: usize,
    ) -> Result<WorkerRole<Self::Worker>, Report<ClusterError>>;
}

/// Cancels a [VmCluster] startup from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Runs a scheduler and a set of workers, using an [InstanceFactory] to create them.
pub struct VmCluster<FACTORY: InstanceFactory> {
    factory: FACTORY,
    cluster: ClusterHandle,
    n_workers: usize,
    scheduler: Option<SchedulerRole<FACTORY::Scheduler>>,
    workers: Vec<WorkerRole<FACTORY::Worker>>,
    next_worker: usize,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<FACTORY: InstanceFactory> VmCluster<FACTORY> {
    /// Create a cluster that will start `n_workers` workers once the scheduler is running.
    pub fn new(factory: FACTORY, cluster: ClusterHandle, n_workers: usize) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            factory,
            cluster,
            n_workers,
            scheduler: None,
            workers: Vec::new(),
            next_worker: 0,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    pub fn factory(&self) -> &FACTORY {
        &self.factory
    }

    /// Instances created after this call see any changes made to the factory.
    pub fn factory_mut(&mut self) -> &mut FACTORY {
        &mut self.factory
    }

    pub fn scheduler(&self) -> Option<&SchedulerRole<FACTORY::Scheduler>> {
        self.scheduler.as_ref()
    }

    pub fn workers(&self) -> &[WorkerRole<FACTORY::Worker>] {
        &self.workers
    }

    /// The scheduler's external address, once it has been published.
    pub fn scheduler_address(&self) -> Option<String> {
        self.cluster.scheduler().map(|s| s.address)
    }

    pub fn published_scheduler(&self) -> Option<PublishedScheduler> {
        self.cluster.scheduler()
    }

    /// Return a handle that can cancel [VmCluster::start] while it is running.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel_tx.clone())
    }

    /// Start the scheduler, and then the initial set of workers. If startup is cancelled, any
    /// in-flight provisioning is abandoned; call [VmCluster::close] to release whatever was
    /// created. A cancelled cluster can be started again once it has been closed.
    #[instrument(skip(self), fields(cluster = %self.cluster.name()))]
    pub async fn start(&mut self) -> Result<(), Report<ClusterError>> {
        let cancel_tx = self.cancel_tx.clone();
        let mut cancel = self.cancel_rx.clone();
        tokio::select! {
            result = self.start_internal() => result,
            _ = cancel.wait_for(|cancelled| *cancelled) => {
                event!(Level::INFO, "Cluster startup cancelled");
                // A cancel only applies to the startup it interrupted.
                cancel_tx.send_replace(false);
                Err(Report::new(ClusterError::Cancelled))
            }
        }
    }

    async fn start_internal(&mut self) -> Result<(), Report<ClusterError>> {
        if self.scheduler.is_some() {
            return Err(Report::new(ClusterError::AlreadyStarted));
        }

        let role = self.factory.scheduler(&self.cluster)?;
        let scheduler = self.scheduler.insert(role);
        scheduler.start().await?;

        let n_workers = self.n_workers;
        self.scale(n_workers).await
    }

    /// Start or close workers until there are `n` of them. New workers start concurrently.
    #[instrument(skip(self), fields(cluster = %self.cluster.name()))]
    pub async fn scale(&mut self, n: usize) -> Result<(), Report<ClusterError>> {
        if self.cluster.scheduler().is_none() {
            return Err(Report::new(ClusterError::SchedulerNotPublished));
        }

        self.n_workers = n;
        let current = self.workers.len();
        if n > current {
            let mut new_workers = Vec::with_capacity(n - current);
            for _ in current..n {
                let ordinal = self.next_worker;
                self.next_worker += 1;
                new_workers.push(self.factory.worker(&self.cluster, ordinal)?);
            }

            // Workers are tracked before they start, so that `close` releases them even if this
            // future is dropped partway through or some of them fail.
            self.workers.extend(new_workers);
            let results =
                join_all(self.workers[current..].iter_mut().map(|worker| worker.start())).await;
            merge_results(results)
        } else if n < current {
            let results = join_all(self.workers[n..].iter_mut().map(|worker| worker.close())).await;
            self.workers.truncate(n);
            merge_results(results)
        } else {
            Ok(())
        }
    }

    /// Close all the workers and then the scheduler. Every instance is released even if some
    /// of them fail, and all the failures are returned together.
    #[instrument(skip(self), fields(cluster = %self.cluster.name()))]
    pub async fn close(&mut self) -> Result<(), Report<ClusterError>> {
        self.cluster.log("Closing cluster");
        self.cancel_tx.send_replace(false);
        let mut workers = std::mem::take(&mut self.workers);
        let mut results = join_all(workers.iter_mut().map(|worker| worker.close())).await;

        if let Some(mut scheduler) = self.scheduler.take() {
            results.push(scheduler.close().await);
            self.cluster.unpublish_scheduler();
        }

        merge_results(results)
    }
}

fn merge_results(
    results: impl IntoIterator<Item = Result<(), Report<ClusterError>>>,
) -> Result<(), Report<ClusterError>> {
    let error = results
        .into_iter()
        .filter_map(Result::err)
        .fold(None, |acc: Option<Report<ClusterError>>, e| match acc {
            Some(mut acc) => {
                acc.extend_one(e);
                Some(acc)
            }
            None => Some(e),
        });

    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
