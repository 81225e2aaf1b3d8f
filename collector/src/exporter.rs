use crate::{
    error::CollectError,
    filter::{
        ClusterFilter,
        MATCH_ALL,
    },
    gatherer::{
        ClusterGatherer,
        MetricGatherer,
    },
    metrics::{
        render,
        Catalog,
        MetricDesc,
        Sample,
    },
    orchestrator::{
        Orchestrator,
        ScrapeSettings,
        DEFAULT_MAX_CONCURRENCY,
        DEFAULT_TIMEOUT,
    },
};
use eyre::{
    bail,
    Result,
};
use prometheus::proto::MetricFamily;
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;

/// Samples buffered between the scrape workers and the draining consumer.
const SAMPLE_BUFFER: usize = 256;

/// Settings of an [`Exporter`], fixed for its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct ExporterSettings {
    pub region: String,
    pub cluster_filter: String,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub container_instance_metrics: bool,
    pub instance_cpu_metrics: bool,
}

impl ExporterSettings {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            cluster_filter: MATCH_ALL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            container_instance_metrics: true,
            instance_cpu_metrics: false,
        }
    }

    pub fn cluster_filter(mut self, pattern: impl Into<String>) -> Self {
        self.cluster_filter = pattern.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn container_instance_metrics(mut self, enabled: bool) -> Self {
        self.container_instance_metrics = enabled;
        self
    }

    pub fn instance_cpu_metrics(mut self, enabled: bool) -> Self {
        self.instance_cpu_metrics = enabled;
        self
    }
}

/// Outcome of a scrape together with everything it produced.
#[derive(Debug)]
pub struct ScrapeResult {
    pub success: bool,
    pub error: Option<CollectError>,
    pub samples: Vec<Sample>,
}

/// The describe/collect surface of the exporter.
pub struct Exporter {
    catalog: Catalog,
    orchestrator: Orchestrator,
}

impl Exporter {
    pub fn new(
        settings: ExporterSettings,
        gatherer: Arc<dyn ClusterGatherer>,
        instance_metrics: Option<Arc<dyn MetricGatherer>>,
    ) -> Result<Self> {
        if settings.region.trim().is_empty() {
            bail!("An AWS region is required");
        }
        if settings.max_concurrency == 0 {
            bail!("Max concurrency must be greater than zero");
        }
        if settings.timeout.is_zero() {
            bail!("Collect timeout must be greater than zero");
        }
        let filter = ClusterFilter::new(&settings.cluster_filter)?;

        let instance_metrics = match instance_metrics {
            Some(gatherer) if settings.container_instance_metrics && settings.instance_cpu_metrics => Some(gatherer),
            Some(_) => {
                debug!("Instance metrics gatherer given but instance CPU metrics are disabled");
                None
            }
            None => {
                if settings.instance_cpu_metrics {
                    warn!("Instance CPU metrics enabled without a metrics gatherer, not collecting them");
                }
                None
            }
        };

        let catalog = Catalog::new(settings.container_instance_metrics, instance_metrics.is_some());
        let orchestrator = Orchestrator::new(
            settings.region,
            filter,
            ScrapeSettings {
                timeout: settings.timeout,
                max_concurrency: settings.max_concurrency,
                container_instances: settings.container_instance_metrics,
            },
            gatherer,
            instance_metrics,
        );

        Ok(Self { catalog, orchestrator })
    }

    /// Descriptors of every metric `collect` can produce.
    pub fn describe(&self) -> &[MetricDesc] {
        self.catalog.descs()
    }

    /// Runs a scrape, returning the samples. `ecs_up` is always the last one.
    pub async fn collect(&self) -> Vec<Sample> {
        self.scrape().await.samples
    }

    pub async fn scrape(&self) -> ScrapeResult {
        let (tx, mut rx) = mpsc::channel(SAMPLE_BUFFER);
        let drain = async {
            let mut samples = Vec::new();
            while let Some(sample) = rx.recv().await {
                samples.push(sample);
            }
            samples
        };

        let (summary, samples) = tokio::join!(self.orchestrator.scrape(tx), drain);
        ScrapeResult {
            success: summary.up,
            error: summary.error,
            samples,
        }
    }

    /// Prometheus families for samples of this exporter.
    pub fn render(&self, samples: &[Sample]) -> Result<Vec<MetricFamily>> {
        render::metric_families(self.catalog.descs(), samples)
    }
}
