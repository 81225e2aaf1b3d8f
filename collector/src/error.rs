/// Reasons a scrape cycle is marked as failed.
///
/// At most one of these is recorded per scrape, the first one to arrive.
#[derive(thiserror::Error, Debug)]
pub enum CollectError {
    #[error("failed listing clusters: {0}")]
    ListClusters(eyre::Report),
    #[error("failed collecting service metrics of cluster {cluster}: {error}")]
    Services { cluster: String, error: eyre::Report },
    #[error("failed collecting container instance metrics of cluster {cluster}: {error}")]
    ContainerInstances { cluster: String, error: eyre::Report },
    #[error("failed collecting metrics of instance {instance} in cluster {cluster}: {error}")]
    InstanceMetrics {
        cluster: String,
        instance: String,
        error: eyre::Report,
    },
    #[error("scrape was cancelled before finishing")]
    Cancelled,
    #[error("scrape did not finish within {0:?}")]
    DeadlineExceeded(std::time::Duration),
    #[error("cluster worker stopped unexpectedly: {0}")]
    WorkerFailed(String),
    #[error("the sample receiver is gone")]
    OutputClosed,
    #[error("the concurrency limiter was closed")]
    LimiterClosed,
}

impl CollectError {
    /// Whether the error only reflects the scrape being cancelled, rather than an upstream failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CollectError::Cancelled | CollectError::DeadlineExceeded(_))
    }
}
