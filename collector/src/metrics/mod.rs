//! # Metric Catalog
//!
//! Every gauge the exporter can emit, described once as an enum so the
//! mapping from metric kind to name, help text and label set is explicit.
//!
//! ## Key Components
//!
//! - **`MetricKind`**: One variant per exported gauge
//! - **`MetricDesc`**: Fully qualified descriptor handed out by `describe()`
//! - **`Catalog`**: The descriptors active for one exporter configuration
//! - **`Sample`**: One labelled gauge value produced during a scrape

pub mod render;

use std::fmt;
use strum::{
    EnumIter,
    IntoEnumIterator as _,
    IntoStaticStr,
};

pub const NAMESPACE: &str = "ecs";

pub const LABEL_REGION: &str = "region";
pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_SERVICE: &str = "service";
pub const LABEL_INSTANCE: &str = "instance";

const REGION_LABELS: &[&str] = &[LABEL_REGION];
const CLUSTER_LABELS: &[&str] = &[LABEL_REGION, LABEL_CLUSTER];
const SERVICE_LABELS: &[&str] = &[LABEL_REGION, LABEL_CLUSTER, LABEL_SERVICE];
const INSTANCE_LABELS: &[&str] = &[LABEL_REGION, LABEL_CLUSTER, LABEL_INSTANCE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum MetricKind {
    Up,
    Clusters,
    Services,
    ServiceDesiredTasks,
    ServicePendingTasks,
    ServiceRunningTasks,
    ContainerInstances,
    ContainerInstanceAgentConnected,
    ContainerInstanceActive,
    ContainerInstancePendingTasks,
    ContainerInstanceCpuUtilization,
}

impl MetricKind {
    /// Metric name without the namespace.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn help(&self) -> &'static str {
        match self {
            MetricKind::Up => "Was the last query of ecs successful.",
            MetricKind::Clusters => "The total number of clusters",
            MetricKind::Services => "The total number of services",
            MetricKind::ServiceDesiredTasks => {
                "The desired number of instantiations of the task definition to keep running regarding a service"
            }
            MetricKind::ServicePendingTasks => {
                "The number of tasks in the cluster that are in the PENDING state regarding a service"
            }
            MetricKind::ServiceRunningTasks => {
                "The number of tasks in the cluster that are in the RUNNING state regarding a service"
            }
            MetricKind::ContainerInstances => "The total number of container instances",
            MetricKind::ContainerInstanceAgentConnected => "The connected state of the container instance agent",
            MetricKind::ContainerInstanceActive => {
                "The status of the container instance in ACTIVE state, indicates that the container instance can accept tasks."
            }
            MetricKind::ContainerInstancePendingTasks => {
                "The number of tasks on the container instance that are in the PENDING status."
            }
            MetricKind::ContainerInstanceCpuUtilization => {
                "The maximum CPU utilization of the container instance host over the last datapoint, in percent."
            }
        }
    }

    /// Label names, in the order sample label values are given.
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            MetricKind::Up | MetricKind::Clusters => REGION_LABELS,
            MetricKind::Services | MetricKind::ContainerInstances => CLUSTER_LABELS,
            MetricKind::ServiceDesiredTasks | MetricKind::ServicePendingTasks | MetricKind::ServiceRunningTasks => {
                SERVICE_LABELS
            }
            MetricKind::ContainerInstanceAgentConnected
            | MetricKind::ContainerInstanceActive
            | MetricKind::ContainerInstancePendingTasks
            | MetricKind::ContainerInstanceCpuUtilization => INSTANCE_LABELS,
        }
    }

    pub fn fq_name(&self) -> String {
        format!("{NAMESPACE}_{}", self.name())
    }

    pub fn is_container_instance(&self) -> bool {
        matches!(
            self,
            MetricKind::ContainerInstances
                | MetricKind::ContainerInstanceAgentConnected
                | MetricKind::ContainerInstanceActive
                | MetricKind::ContainerInstancePendingTasks
                | MetricKind::ContainerInstanceCpuUtilization
        )
    }
}

/// Static description of one gauge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDesc {
    pub kind: MetricKind,
    pub fq_name: String,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

impl From<MetricKind> for MetricDesc {
    fn from(kind: MetricKind) -> Self {
        Self {
            kind,
            fq_name: kind.fq_name(),
            help: kind.help(),
            labels: kind.labels(),
        }
    }
}

/// The set of descriptors an exporter advertises, fixed at construction time.
#[derive(Debug, Clone)]
pub struct Catalog {
    descs: Vec<MetricDesc>,
}

impl Catalog {
    pub fn new(container_instances: bool, instance_cpu: bool) -> Self {
        let descs = MetricKind::iter()
            .filter(|kind| container_instances || !kind.is_container_instance())
            .filter(|kind| instance_cpu || *kind != MetricKind::ContainerInstanceCpuUtilization)
            .map(MetricDesc::from)
            .collect();
        Self { descs }
    }

    pub fn descs(&self) -> &[MetricDesc] {
        &self.descs
    }
}

/// One gauge value. `label_values` follow the order of `kind.labels()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub kind: MetricKind,
    pub label_values: Vec<String>,
    pub value: f64,
}

impl Sample {
    pub fn up(region: &str, up: bool) -> Self {
        Self::new(MetricKind::Up, vec![region.to_string()], bool_value(up))
    }

    pub fn clusters(region: &str, count: usize) -> Self {
        Self::new(MetricKind::Clusters, vec![region.to_string()], count as f64)
    }

    pub fn cluster_gauge(kind: MetricKind, region: &str, cluster: &str, value: f64) -> Self {
        Self::new(kind, vec![region.to_string(), cluster.to_string()], value)
    }

    /// A per-entity gauge, the entity being a service name or an instance id depending on `kind`.
    pub fn entity_gauge(kind: MetricKind, region: &str, cluster: &str, entity: &str, value: f64) -> Self {
        Self::new(
            kind,
            vec![region.to_string(), cluster.to_string(), entity.to_string()],
            value,
        )
    }

    fn new(kind: MetricKind, label_values: Vec<String>, value: f64) -> Self {
        debug_assert_eq!(kind.labels().len(), label_values.len());
        Self {
            kind,
            label_values,
            value,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.kind
            .labels()
            .iter()
            .position(|label| *label == name)
            .and_then(|idx| self.label_values.get(idx))
            .map(String::as_str)
    }
}

impl fmt::Display for Sample {
    /// Renders the sample the way it appears in the exposition format, with labels sorted by name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels = self
            .kind
            .labels()
            .iter()
            .zip(self.label_values.iter())
            .collect::<Vec<_>>();
        labels.sort_by_key(|(name, _)| **name);
        let labels = labels
            .into_iter()
            .map(|(name, value)| format!("{name}=\"{value}\""))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}{{{labels}}} {}", self.kind.fq_name(), self.value)
    }
}

pub fn bool_value(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
