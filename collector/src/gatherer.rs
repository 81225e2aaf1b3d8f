use crate::types::{
    Cluster,
    ContainerInstance,
    InstanceMetrics,
    Service,
};
use eyre::Result;
use std::{
    future::Future,
    pin::Pin,
};

pub type GatherFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Access to the cluster orchestration API.
///
/// Implementations own pagination and describe-call batching, every method
/// returns one complete logical list.
pub trait ClusterGatherer: Send + Sync {
    /// All clusters of the region, unfiltered.
    fn clusters(&self) -> GatherFuture<'_, Vec<Cluster>>;

    /// All services of a cluster.
    fn cluster_services<'a>(&'a self, cluster: &'a Cluster) -> GatherFuture<'a, Vec<Service>>;

    /// All container instances registered to a cluster.
    fn cluster_container_instances<'a>(&'a self, cluster: &'a Cluster) -> GatherFuture<'a, Vec<ContainerInstance>>;
}

/// Access to the metrics timeseries API.
pub trait MetricGatherer: Send + Sync {
    /// Latest utilization of an EC2 instance. Absence of datapoints yields zeroed metrics, not an error.
    fn instance_metrics<'a>(&'a self, instance_id: &'a str) -> GatherFuture<'a, InstanceMetrics>;
}
