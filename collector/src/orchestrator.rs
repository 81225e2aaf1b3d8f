//! # Scrape Orchestrator
//!
//! Runs one scrape cycle at a time:
//!
//! 1. Lists the clusters of the region and publishes their total count
//! 2. Spawns one worker per cluster accepted by the filter, at most
//!    `max_concurrency` of them holding a limiter permit at once
//! 3. Every worker publishes the metrics of its cluster through the shared
//!    [`Publisher`]
//! 4. The first failure cancels the scrape, later failures are dropped
//! 5. Once all workers are joined, `ecs_up` is published as the final sample
//!
//! Cancellation is cooperative. Workers race every upstream call, limiter
//! acquisition and publish against the scrape token, which fires on the first
//! error or when the scrape timeout elapses.

use crate::{
    error::CollectError,
    filter::ClusterFilter,
    gatherer::{
        ClusterGatherer,
        MetricGatherer,
    },
    metrics::{
        bool_value,
        MetricKind,
        Sample,
    },
    publisher::Publisher,
    types::{
        Cluster,
        ContainerInstance,
        Service,
    },
};
use std::{
    future::Future,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex as StdMutex,
        PoisonError,
    },
    time::{
        Duration,
        Instant,
    },
};
use tokio::{
    sync::{
        mpsc::Sender,
        Mutex,
        OwnedSemaphorePermit,
        Semaphore,
    },
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Instance metric lookups a single cluster worker keeps in flight.
const INSTANCE_METRICS_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    /// Budget of a whole scrape cycle.
    pub timeout: Duration,
    /// Cluster workers allowed to run at the same time.
    pub max_concurrency: usize,
    /// Gather container instance metrics next to the service metrics.
    pub container_instances: bool,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            container_instances: true,
        }
    }
}

/// What a scrape cycle ended with. The samples themselves went to the channel.
#[derive(Debug)]
pub struct ScrapeSummary {
    pub up: bool,
    pub error: Option<CollectError>,
    /// Clusters listed upstream, before filtering.
    pub clusters: usize,
    /// Clusters a worker was dispatched for.
    pub dispatched: usize,
    /// Most workers that held a limiter permit at the same time.
    pub peak_workers: usize,
    pub elapsed: Duration,
}

pub struct Orchestrator {
    region: Arc<str>,
    filter: ClusterFilter,
    settings: ScrapeSettings,
    gatherer: Arc<dyn ClusterGatherer>,
    instance_metrics: Option<Arc<dyn MetricGatherer>>,
    scrape_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        region: impl Into<Arc<str>>,
        filter: ClusterFilter,
        settings: ScrapeSettings,
        gatherer: Arc<dyn ClusterGatherer>,
        instance_metrics: Option<Arc<dyn MetricGatherer>>,
    ) -> Self {
        Self {
            region: region.into(),
            filter,
            settings,
            gatherer,
            instance_metrics,
            scrape_lock: Mutex::new(()),
        }
    }

    /// Runs one scrape cycle, sending every sample to `sender`.
    ///
    /// Concurrent calls queue on the scrape lock. The channel is only written
    /// to while this future runs, all senders are dropped when it returns.
    pub async fn scrape(&self, sender: Sender<Sample>) -> ScrapeSummary {
        let _lock = self.scrape_lock.lock().await;
        let started = Instant::now();
        debug!(region = %self.region, "Start collecting...");

        let token = CancellationToken::new();
        let _cancel_on_exit = token.clone().drop_guard();
        let deadline = tokio::spawn(expire_after(token.clone(), self.settings.timeout));
        let first_error = FirstError::new(token.clone());
        let publisher = Publisher::new(sender.clone(), token.clone());
        let worker_gauge = ConcurrencyGauge::default();

        let (clusters, dispatched) = match self.run(&publisher, &first_error, &worker_gauge).await {
            Ok(counts) => counts,
            Err(err) => {
                first_error.record(err);
                (0, 0)
            }
        };
        drop(publisher);

        token.cancel();
        let expired = deadline.await.unwrap_or(false);
        let error = match first_error.take() {
            Some(CollectError::Cancelled) | None if expired => Some(CollectError::DeadlineExceeded(self.settings.timeout)),
            error => error,
        };

        let up = error.is_none();
        if let Some(err) = &error {
            error!(region = %self.region, "Error collecting metrics: {err}");
        }
        if sender.send(Sample::up(&self.region, up)).await.is_err() {
            warn!(region = %self.region, "Scrape consumer left before the up metric was sent");
        }

        let elapsed = started.elapsed();
        let peak_workers = worker_gauge.peak();
        debug!(
            region = %self.region,
            up,
            clusters,
            dispatched,
            peak_workers,
            elapsed_ms = elapsed.as_millis() as u64,
            "Collect finished"
        );

        ScrapeSummary {
            up,
            error,
            clusters,
            dispatched,
            peak_workers,
            elapsed,
        }
    }

    /// Lists, filters and fans out. Returns the listed and the dispatched cluster counts.
    async fn run(
        &self,
        publisher: &Publisher,
        first_error: &FirstError,
        gauge: &ConcurrencyGauge,
    ) -> Result<(usize, usize), CollectError> {
        let token = publisher.token();
        let clusters = until_cancelled(token, self.gatherer.clusters())
            .await?
            .map_err(CollectError::ListClusters)?;
        debug!(count = clusters.len(), "Got clusters");

        publisher.publish(Sample::clusters(&self.region, clusters.len())).await?;

        let limiter = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let worker = ClusterWorker {
            region: self.region.clone(),
            gatherer: self.gatherer.clone(),
            instance_metrics: self.instance_metrics.clone(),
            container_instances: self.settings.container_instances,
            publisher: publisher.clone(),
        };
        let mut workers = JoinSet::new();
        let total = clusters.len();

        for cluster in clusters {
            if !self.filter.matches(&cluster) {
                debug!(cluster = %cluster.name, "Cluster filtered");
                continue;
            }
            debug!(cluster = %cluster.name, "Valid cluster found");

            let permit = match acquire(&limiter, token).await {
                Ok(permit) => permit,
                Err(err) => {
                    first_error.record(err);
                    break;
                }
            };

            let worker = worker.clone();
            let first_error = first_error.clone();
            let gauge = gauge.clone();
            workers.spawn(async move {
                let _permit: OwnedSemaphorePermit = permit;
                let _in_flight = gauge.enter();
                if let Err(err) = worker.collect(&cluster).await {
                    debug!(cluster = %cluster.name, "Cluster worker failed: {err}");
                    first_error.record(err);
                }
            });
        }

        let dispatched = workers.len();
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                first_error.record(CollectError::WorkerFailed(err.to_string()));
            }
        }

        Ok((total, dispatched))
    }
}

/// Collects the metrics of a single cluster.
#[derive(Clone)]
struct ClusterWorker {
    region: Arc<str>,
    gatherer: Arc<dyn ClusterGatherer>,
    instance_metrics: Option<Arc<dyn MetricGatherer>>,
    container_instances: bool,
    publisher: Publisher,
}

impl ClusterWorker {
    async fn collect(&self, cluster: &Cluster) -> Result<(), CollectError> {
        let token = self.publisher.token();

        let services = until_cancelled(token, self.gatherer.cluster_services(cluster))
            .await?
            .map_err(|error| CollectError::Services {
                cluster: cluster.name.clone(),
                error,
            })?;
        self.publish_services(cluster, &services).await?;

        if !self.container_instances {
            trace!(cluster = %cluster.name, "Container instance metrics disabled, not gathering them");
            return Ok(());
        }

        let instances = until_cancelled(token, self.gatherer.cluster_container_instances(cluster))
            .await?
            .map_err(|error| CollectError::ContainerInstances {
                cluster: cluster.name.clone(),
                error,
            })?;
        self.publish_container_instances(cluster, &instances).await?;

        if let Some(metrics) = &self.instance_metrics {
            self.publish_instance_utilization(metrics.as_ref(), cluster, &instances)
                .await?;
        }

        Ok(())
    }

    async fn publish_services(&self, cluster: &Cluster, services: &[Service]) -> Result<(), CollectError> {
        let region = &self.region;
        let total = Sample::cluster_gauge(MetricKind::Services, region, &cluster.name, services.len() as f64);

        let per_service = services.iter().flat_map(|service| {
            [
                (MetricKind::ServiceDesiredTasks, service.desired),
                (MetricKind::ServicePendingTasks, service.pending),
                (MetricKind::ServiceRunningTasks, service.running),
            ]
            .map(|(kind, value)| Sample::entity_gauge(kind, region, &cluster.name, &service.name, value as f64))
        });

        let samples = std::iter::once(total).chain(per_service).collect::<Vec<_>>();
        self.publisher.publish_all(samples).await
    }

    async fn publish_container_instances(
        &self,
        cluster: &Cluster,
        instances: &[ContainerInstance],
    ) -> Result<(), CollectError> {
        let region = &self.region;
        let total = Sample::cluster_gauge(
            MetricKind::ContainerInstances,
            region,
            &cluster.name,
            instances.len() as f64,
        );

        let per_instance = instances.iter().flat_map(|instance| {
            [
                (
                    MetricKind::ContainerInstanceAgentConnected,
                    bool_value(instance.agent_connected),
                ),
                (MetricKind::ContainerInstanceActive, bool_value(instance.active)),
                (
                    MetricKind::ContainerInstancePendingTasks,
                    instance.pending_tasks as f64,
                ),
            ]
            .map(|(kind, value)| Sample::entity_gauge(kind, region, &cluster.name, &instance.instance_id, value))
        });

        let samples = std::iter::once(total).chain(per_instance).collect::<Vec<_>>();
        self.publisher.publish_all(samples).await
    }

    async fn publish_instance_utilization(
        &self,
        metrics: &dyn MetricGatherer,
        cluster: &Cluster,
        instances: &[ContainerInstance],
    ) -> Result<(), CollectError> {
        for batch in instances.chunks(INSTANCE_METRICS_CONCURRENCY) {
            let lookups = batch
                .iter()
                .map(|instance| self.instance_utilization(metrics, cluster, instance));
            let samples = futures::future::try_join_all(lookups).await?;
            self.publisher.publish_all(samples).await?;
        }
        Ok(())
    }

    async fn instance_utilization(
        &self,
        metrics: &dyn MetricGatherer,
        cluster: &Cluster,
        instance: &ContainerInstance,
    ) -> Result<Sample, CollectError> {
        let utilization = until_cancelled(self.publisher.token(), metrics.instance_metrics(&instance.instance_id))
            .await?
            .map_err(|error| CollectError::InstanceMetrics {
                cluster: cluster.name.clone(),
                instance: instance.instance_id.clone(),
                error,
            })?;

        Ok(Sample::entity_gauge(
            MetricKind::ContainerInstanceCpuUtilization,
            &self.region,
            &cluster.name,
            &instance.instance_id,
            utilization.cpu_utilization,
        ))
    }
}

/// Counts concurrently running sections and remembers the highest count seen.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Counts as running until the returned guard is dropped.
    pub(crate) fn enter(&self) -> InFlight {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self.current.clone())
    }
}

pub(crate) struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps the first error of a scrape and cancels the scrape when it arrives.
#[derive(Clone)]
struct FirstError {
    slot: Arc<StdMutex<Option<CollectError>>>,
    token: CancellationToken,
}

impl FirstError {
    fn new(token: CancellationToken) -> Self {
        Self {
            slot: Default::default(),
            token,
        }
    }

    fn record(&self, err: CollectError) {
        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
            } else {
                trace!("Discarding subsequent scrape error: {err}");
            }
        }
        self.token.cancel();
    }

    fn take(&self) -> Option<CollectError> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Cancels `token` once `timeout` elapsed. Resolves to whether the deadline was what fired.
async fn expire_after(token: CancellationToken, timeout: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Scrape deadline exceeded, cancelling");
            token.cancel();
            true
        }
    }
}

async fn acquire(limiter: &Arc<Semaphore>, token: &CancellationToken) -> Result<OwnedSemaphorePermit, CollectError> {
    if token.is_cancelled() {
        return Err(CollectError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CollectError::Cancelled),
        permit = limiter.clone().acquire_owned() => permit.map_err(|_| CollectError::LimiterClosed),
    }
}

async fn until_cancelled<T>(
    token: &CancellationToken,
    call: impl Future<Output = eyre::Result<T>>,
) -> Result<eyre::Result<T>, CollectError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CollectError::Cancelled),
        result = call => Ok(result),
    }
}
