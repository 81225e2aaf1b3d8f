//! In-memory gatherers for exercising the collection core without AWS.

use crate::{
    gatherer::{
        ClusterGatherer,
        GatherFuture,
        MetricGatherer,
    },
    orchestrator::ConcurrencyGauge,
    types::{
        Cluster,
        ContainerInstance,
        InstanceMetrics,
        Service,
    },
};
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
    },
    time::Duration,
};

/// Serves a fixed set of clusters. Clusters are ordered by name.
#[derive(Debug, Default)]
pub struct StaticGatherer {
    clusters: BTreeSet<String>,
    services: BTreeMap<String, Vec<Service>>,
    instances: BTreeMap<String, Vec<ContainerInstance>>,
    cpu: HashMap<String, f64>,
    fail_clusters: bool,
    fail_services: BTreeSet<String>,
    fail_instances: BTreeSet<String>,
    latency: Option<Duration>,
    calls: ConcurrencyGauge,
}

impl StaticGatherer {
    pub fn with_services(mut self, cluster: &str, services: Vec<Service>) -> Self {
        self.clusters.insert(cluster.to_string());
        self.services.insert(cluster.to_string(), services);
        self
    }

    pub fn with_instances(mut self, cluster: &str, instances: Vec<ContainerInstance>) -> Self {
        self.clusters.insert(cluster.to_string());
        self.instances.insert(cluster.to_string(), instances);
        self
    }

    pub fn with_cpu(mut self, instance_id: &str, utilization: f64) -> Self {
        self.cpu.insert(instance_id.to_string(), utilization);
        self
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn failing_clusters(mut self) -> Self {
        self.fail_clusters = true;
        self
    }

    pub fn failing_services(mut self, cluster: &str) -> Self {
        self.clusters.insert(cluster.to_string());
        self.fail_services.insert(cluster.to_string());
        self
    }

    pub fn failing_instances(mut self, cluster: &str) -> Self {
        self.clusters.insert(cluster.to_string());
        self.fail_instances.insert(cluster.to_string());
        self
    }

    /// Observes how many gatherer calls were in flight at once.
    pub fn call_gauge(&self) -> ConcurrencyGauge {
        self.calls.clone()
    }

    pub fn services(count: usize) -> Vec<Service> {
        (0..count)
            .map(|idx| Service {
                id: format!("arn:aws:ecs:eu-west-1:000000000000:service/service{idx}"),
                name: format!("service{idx}"),
                desired: 3,
                running: 2,
                pending: 1,
            })
            .collect()
    }

    pub fn instances(count: usize) -> Vec<ContainerInstance> {
        (0..count).map(|idx| Self::instance(idx, true, true, 0)).collect()
    }

    pub fn instance(idx: usize, agent_connected: bool, active: bool, pending_tasks: i64) -> ContainerInstance {
        ContainerInstance {
            id: format!("arn:aws:ecs:eu-west-1:000000000000:container-instance/{idx}"),
            instance_id: format!("i-{idx:017}"),
            agent_connected,
            active,
            pending_tasks,
        }
    }

    async fn call(&self) {
        let _in_flight = self.calls.enter();
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl ClusterGatherer for StaticGatherer {
    fn clusters(&self) -> GatherFuture<'_, Vec<Cluster>> {
        Box::pin(async move {
            self.call().await;
            if self.fail_clusters {
                eyre::bail!("ListClusters: AccessDeniedException");
            }
            Ok(self
                .clusters
                .iter()
                .map(|name| Cluster::new(format!("arn:aws:ecs:eu-west-1:000000000000:cluster/{name}"), name))
                .collect())
        })
    }

    fn cluster_services<'a>(&'a self, cluster: &'a Cluster) -> GatherFuture<'a, Vec<Service>> {
        Box::pin(async move {
            self.call().await;
            if self.fail_services.contains(&cluster.name) {
                eyre::bail!("ListServices: ServerException");
            }
            Ok(self.services.get(&cluster.name).cloned().unwrap_or_default())
        })
    }

    fn cluster_container_instances<'a>(&'a self, cluster: &'a Cluster) -> GatherFuture<'a, Vec<ContainerInstance>> {
        Box::pin(async move {
            self.call().await;
            if self.fail_instances.contains(&cluster.name) {
                eyre::bail!("ListContainerInstances: ServerException");
            }
            Ok(self.instances.get(&cluster.name).cloned().unwrap_or_default())
        })
    }
}

impl MetricGatherer for StaticGatherer {
    fn instance_metrics<'a>(&'a self, instance_id: &'a str) -> GatherFuture<'a, InstanceMetrics> {
        Box::pin(async move {
            Ok(InstanceMetrics {
                cpu_utilization: self.cpu.get(instance_id).copied().unwrap_or_default(),
            })
        })
    }
}
