/// Status string the ECS API reports for container instances that accept tasks.
pub const CONTAINER_INSTANCE_STATUS_ACTIVE: &str = "ACTIVE";

/// An ECS cluster. Identity is the cluster ARN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cluster {
    pub id: String,
    pub name: String,
}

impl Cluster {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A service running in a cluster, as seen during one scrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub desired: i64,
    pub running: i64,
    pub pending: i64,
}

/// A host registered to a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInstance {
    /// Container instance ARN.
    pub id: String,
    /// The EC2 instance backing the container instance.
    pub instance_id: String,
    pub agent_connected: bool,
    pub active: bool,
    pub pending_tasks: i64,
}

impl ContainerInstance {
    /// Whether the upstream status string marks the instance as able to accept tasks.
    pub fn is_active_status(status: &str) -> bool {
        status == CONTAINER_INSTANCE_STATUS_ACTIVE
    }
}

/// Utilization of the EC2 instance behind a container instance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstanceMetrics {
    pub cpu_utilization: f64,
}
