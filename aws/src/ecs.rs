//! # ECS
//!
//! ## Key Components
//!
//! - **`EcsApi`**: The six ECS actions the exporter needs, one call per upstream request
//! - **`EcsClient`**: `EcsApi` over the signed JSON 1.1 protocol
//! - **`EcsGatherer`**: `ClusterGatherer` over any `EcsApi`, owning pagination and describe batching

use crate::{
    client::{
        AwsJsonClient,
        JsonVersion,
        ServiceSpec,
    },
    credentials::CredentialsProvider,
    error::AwsError,
    ApiFuture,
};
use ecs_exporter_collector::{
    Cluster,
    ClusterGatherer,
    ContainerInstance,
    GatherFuture,
    Service,
};
use eyre::{
    Result,
    WrapErr as _,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    future::Future,
    sync::Arc,
};
use url::Url;

pub const ECS_SERVICE: ServiceSpec = ServiceSpec {
    name: "ecs",
    target_prefix: "AmazonEC2ContainerServiceV20141113",
    version: JsonVersion::V1_1,
};

/// Page size of the list calls.
pub const API_MAX_RESULTS: u32 = 100;
pub const MAX_DESCRIBE_CLUSTERS: usize = 100;
pub const MAX_DESCRIBE_SERVICES: usize = 10;
pub const MAX_DESCRIBE_CONTAINER_INSTANCES: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    pub max_results: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListClustersResponse {
    pub cluster_arns: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListServicesResponse {
    pub service_arns: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListContainerInstancesResponse {
    pub container_instance_arns: Vec<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescribeClustersRequest {
    pub clusters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescribeServicesRequest {
    pub cluster: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeContainerInstancesRequest {
    pub cluster: String,
    pub container_instances: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Failure {
    pub arn: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterDescription {
    pub cluster_arn: String,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DescribeClustersResponse {
    pub clusters: Vec<ClusterDescription>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceDescription {
    pub service_arn: String,
    pub service_name: String,
    pub desired_count: i64,
    pub running_count: i64,
    pub pending_count: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DescribeServicesResponse {
    pub services: Vec<ServiceDescription>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerInstanceDescription {
    pub container_instance_arn: String,
    pub ec2_instance_id: String,
    pub agent_connected: bool,
    pub status: String,
    pub pending_tasks_count: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DescribeContainerInstancesResponse {
    pub container_instances: Vec<ContainerInstanceDescription>,
    pub failures: Vec<Failure>,
}

pub trait EcsApi: Send + Sync {
    fn list_clusters(&self, request: ListRequest) -> ApiFuture<'_, ListClustersResponse>;
    fn describe_clusters(&self, request: DescribeClustersRequest) -> ApiFuture<'_, DescribeClustersResponse>;
    fn list_services(&self, request: ListRequest) -> ApiFuture<'_, ListServicesResponse>;
    fn describe_services(&self, request: DescribeServicesRequest) -> ApiFuture<'_, DescribeServicesResponse>;
    fn list_container_instances(&self, request: ListRequest) -> ApiFuture<'_, ListContainerInstancesResponse>;
    fn describe_container_instances(
        &self,
        request: DescribeContainerInstancesRequest,
    ) -> ApiFuture<'_, DescribeContainerInstancesResponse>;
}

#[derive(Debug, Clone)]
pub struct EcsClient {
    client: AwsJsonClient,
}

impl EcsClient {
    pub fn new(
        region: &str,
        endpoint: Option<Url>,
        credentials: Arc<CredentialsProvider>,
    ) -> Result<Self, AwsError> {
        Ok(Self {
            client: AwsJsonClient::new(ECS_SERVICE, region, endpoint, credentials)?,
        })
    }
}

impl EcsApi for EcsClient {
    fn list_clusters(&self, request: ListRequest) -> ApiFuture<'_, ListClustersResponse> {
        Box::pin(async move { self.client.call("ListClusters", &request).await })
    }

    fn describe_clusters(&self, request: DescribeClustersRequest) -> ApiFuture<'_, DescribeClustersResponse> {
        Box::pin(async move { self.client.call("DescribeClusters", &request).await })
    }

    fn list_services(&self, request: ListRequest) -> ApiFuture<'_, ListServicesResponse> {
        Box::pin(async move { self.client.call("ListServices", &request).await })
    }

    fn describe_services(&self, request: DescribeServicesRequest) -> ApiFuture<'_, DescribeServicesResponse> {
        Box::pin(async move { self.client.call("DescribeServices", &request).await })
    }

    fn list_container_instances(&self, request: ListRequest) -> ApiFuture<'_, ListContainerInstancesResponse> {
        Box::pin(async move { self.client.call("ListContainerInstances", &request).await })
    }

    fn describe_container_instances(
        &self,
        request: DescribeContainerInstancesRequest,
    ) -> ApiFuture<'_, DescribeContainerInstancesResponse> {
        Box::pin(async move { self.client.call("DescribeContainerInstances", &request).await })
    }
}

/// Follows continuation tokens until the upstream stops returning one.
async fn paginate<F, Fut>(mut fetch: F) -> Result<Vec<String>, AwsError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<String>, Option<String>), AwsError>>,
{
    let mut arns = Vec::new();
    let mut next_token = None;
    loop {
        let (page, next) = fetch(next_token.take()).await?;
        arns.extend(page);
        match next.filter(|token| !token.is_empty()) {
            Some(token) => next_token = Some(token),
            None => return Ok(arns),
        }
    }
}

fn log_failures(action: &str, failures: &[Failure]) {
    for failure in failures {
        warn!(
            action,
            arn = failure.arn.as_deref().unwrap_or_default(),
            reason = failure.reason.as_deref().unwrap_or_default(),
            "ECS reported a describe failure"
        );
    }
}

pub struct EcsGatherer<A> {
    api: A,
}

impl<A: EcsApi> EcsGatherer<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let arns = paginate(|next_token| async move {
            let page = self
                .api
                .list_clusters(ListRequest {
                    cluster: None,
                    next_token,
                    max_results: API_MAX_RESULTS,
                })
                .await?;
            Ok::<_, AwsError>((page.cluster_arns, page.next_token))
        })
        .await
        .wrap_err("Failed listing clusters")?;

        let mut clusters = Vec::with_capacity(arns.len());
        for batch in arns.chunks(MAX_DESCRIBE_CLUSTERS) {
            let described = self
                .api
                .describe_clusters(DescribeClustersRequest {
                    clusters: batch.to_vec(),
                })
                .await
                .wrap_err("Failed describing clusters")?;
            log_failures("DescribeClusters", &described.failures);
            clusters.extend(
                described
                    .clusters
                    .into_iter()
                    .map(|cluster| Cluster::new(cluster.cluster_arn, cluster.cluster_name)),
            );
        }

        debug!("Got {} clusters", clusters.len());
        Ok(clusters)
    }

    pub async fn list_services(&self, cluster: &Cluster) -> Result<Vec<Service>> {
        debug!(cluster = %cluster.name, "Getting service list");
        let cluster_id = cluster.id.as_str();
        let arns = paginate(|next_token| async move {
            let page = self
                .api
                .list_services(ListRequest {
                    cluster: Some(cluster_id.to_string()),
                    next_token,
                    max_results: API_MAX_RESULTS,
                })
                .await?;
            Ok::<_, AwsError>((page.service_arns, page.next_token))
        })
        .await
        .wrap_err_with(|| format!("Failed listing services of cluster {}", cluster.name))?;

        if arns.is_empty() {
            debug!(cluster = %cluster.name, "Ignoring services fetching, no services in cluster");
            return Ok(Vec::new());
        }

        let batches = arns.chunks(MAX_DESCRIBE_SERVICES).map(|batch| {
            self.api.describe_services(DescribeServicesRequest {
                cluster: cluster.id.clone(),
                services: batch.to_vec(),
            })
        });
        let described = futures::future::try_join_all(batches)
            .await
            .wrap_err_with(|| format!("Failed describing services of cluster {}", cluster.name))?;

        let services = described
            .into_iter()
            .flat_map(|batch| {
                log_failures("DescribeServices", &batch.failures);
                batch.services
            })
            .map(|service| Service {
                id: service.service_arn,
                name: service.service_name,
                desired: service.desired_count,
                running: service.running_count,
                pending: service.pending_count,
            })
            .collect::<Vec<_>>();

        debug!(cluster = %cluster.name, "Got {} services", services.len());
        Ok(services)
    }

    pub async fn list_container_instances(&self, cluster: &Cluster) -> Result<Vec<ContainerInstance>> {
        debug!(cluster = %cluster.name, "Getting container instance list");
        let cluster_id = cluster.id.as_str();
        let arns = paginate(|next_token| async move {
            let page = self
                .api
                .list_container_instances(ListRequest {
                    cluster: Some(cluster_id.to_string()),
                    next_token,
                    max_results: API_MAX_RESULTS,
                })
                .await?;
            Ok::<_, AwsError>((page.container_instance_arns, page.next_token))
        })
        .await
        .wrap_err_with(|| format!("Failed listing container instances of cluster {}", cluster.name))?;

        if arns.is_empty() {
            debug!(cluster = %cluster.name, "Ignoring container instance fetching, no container instances in cluster");
            return Ok(Vec::new());
        }

        let mut instances = Vec::with_capacity(arns.len());
        for batch in arns.chunks(MAX_DESCRIBE_CONTAINER_INSTANCES) {
            let described = self
                .api
                .describe_container_instances(DescribeContainerInstancesRequest {
                    cluster: cluster.id.clone(),
                    container_instances: batch.to_vec(),
                })
                .await
                .wrap_err_with(|| format!("Failed describing container instances of cluster {}", cluster.name))?;
            log_failures("DescribeContainerInstances", &described.failures);
            instances.extend(described.container_instances.into_iter().map(|instance| {
                ContainerInstance {
                    active: ContainerInstance::is_active_status(&instance.status),
                    id: instance.container_instance_arn,
                    instance_id: instance.ec2_instance_id,
                    agent_connected: instance.agent_connected,
                    pending_tasks: instance.pending_tasks_count,
                }
            }));
        }

        debug!(cluster = %cluster.name, "Got {} container instances", instances.len());
        Ok(instances)
    }
}

impl<A: EcsApi> ClusterGatherer for EcsGatherer<A> {
    fn clusters(&self) -> GatherFuture<'_, Vec<Cluster>> {
        Box::pin(self.list_clusters())
    }

    fn cluster_services<'a>(&'a self, cluster: &'a Cluster) -> GatherFuture<'a, Vec<Service>> {
        Box::pin(self.list_services(cluster))
    }

    fn cluster_container_instances<'a>(&'a self, cluster: &'a Cluster) -> GatherFuture<'a, Vec<ContainerInstance>> {
        Box::pin(self.list_container_instances(cluster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Serves ARNs in pages of `page_size` and records every request.
    #[derive(Default)]
    struct MockEcs {
        page_size: usize,
        clusters: Vec<String>,
        services: Vec<String>,
        instances: Vec<String>,
        fail_describe_services: bool,
        list_requests: Mutex<Vec<ListRequest>>,
        describe_batches: Mutex<Vec<(&'static str, usize)>>,
    }

    impl MockEcs {
        fn new(page_size: usize) -> Self {
            Self {
                page_size,
                ..Default::default()
            }
        }

        fn page(&self, arns: &[String], request: ListRequest) -> (Vec<String>, Option<String>) {
            let start = request
                .next_token
                .as_deref()
                .map(|token| token.parse::<usize>().unwrap())
                .unwrap_or_default();
            self.list_requests.lock().unwrap().push(request);
            let end = (start + self.page_size).min(arns.len());
            // the last page carries an empty token, like ECS sometimes does
            let next = if end < arns.len() { end.to_string() } else { String::new() };
            (arns[start..end].to_vec(), Some(next))
        }

        fn record(&self, action: &'static str, size: usize) {
            self.describe_batches.lock().unwrap().push((action, size));
        }

        fn batches(&self, action: &str) -> Vec<usize> {
            self.describe_batches
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, _)| *a == action)
                .map(|(_, size)| *size)
                .collect()
        }
    }

    fn arns(kind: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|idx| format!("arn:aws:ecs:eu-west-1:000000000000:{kind}/{kind}{idx}"))
            .collect()
    }

    fn name_of(arn: &str) -> String {
        arn.rsplit('/').next().unwrap().to_string()
    }

    impl EcsApi for MockEcs {
        fn list_clusters(&self, request: ListRequest) -> ApiFuture<'_, ListClustersResponse> {
            let (cluster_arns, next_token) = self.page(&self.clusters, request);
            Box::pin(async move {
                Ok(ListClustersResponse {
                    cluster_arns,
                    next_token,
                })
            })
        }

        fn describe_clusters(&self, request: DescribeClustersRequest) -> ApiFuture<'_, DescribeClustersResponse> {
            self.record("DescribeClusters", request.clusters.len());
            Box::pin(async move {
                Ok(DescribeClustersResponse {
                    clusters: request
                        .clusters
                        .iter()
                        .map(|arn| ClusterDescription {
                            cluster_arn: arn.clone(),
                            cluster_name: name_of(arn),
                        })
                        .collect(),
                    failures: Vec::new(),
                })
            })
        }

        fn list_services(&self, request: ListRequest) -> ApiFuture<'_, ListServicesResponse> {
            let (service_arns, next_token) = self.page(&self.services, request);
            Box::pin(async move {
                Ok(ListServicesResponse {
                    service_arns,
                    next_token,
                })
            })
        }

        fn describe_services(&self, request: DescribeServicesRequest) -> ApiFuture<'_, DescribeServicesResponse> {
            self.record("DescribeServices", request.services.len());
            let fail = self.fail_describe_services;
            Box::pin(async move {
                if fail {
                    return Err(AwsError::from_response(
                        "DescribeServices",
                        400,
                        br#"{"__type":"ClientException","message":"boom"}"#,
                    ));
                }
                Ok(DescribeServicesResponse {
                    services: request
                        .services
                        .iter()
                        .map(|arn| ServiceDescription {
                            service_arn: arn.clone(),
                            service_name: name_of(arn),
                            desired_count: 3,
                            running_count: 2,
                            pending_count: 1,
                        })
                        .collect(),
                    failures: Vec::new(),
                })
            })
        }

        fn list_container_instances(&self, request: ListRequest) -> ApiFuture<'_, ListContainerInstancesResponse> {
            let (container_instance_arns, next_token) = self.page(&self.instances, request);
            Box::pin(async move {
                Ok(ListContainerInstancesResponse {
                    container_instance_arns,
                    next_token,
                })
            })
        }

        fn describe_container_instances(
            &self,
            request: DescribeContainerInstancesRequest,
        ) -> ApiFuture<'_, DescribeContainerInstancesResponse> {
            self.record("DescribeContainerInstances", request.container_instances.len());
            Box::pin(async move {
                Ok(DescribeContainerInstancesResponse {
                    container_instances: request
                        .container_instances
                        .iter()
                        .enumerate()
                        .map(|(idx, arn)| ContainerInstanceDescription {
                            container_instance_arn: arn.clone(),
                            ec2_instance_id: format!("i-{idx:017}"),
                            agent_connected: idx % 2 == 0,
                            status: if idx % 3 == 0 { "ACTIVE" } else { "DRAINING" }.to_string(),
                            pending_tasks_count: idx as i64,
                        })
                        .collect(),
                    failures: Vec::new(),
                })
            })
        }
    }

    fn cluster() -> Cluster {
        Cluster::new("arn:aws:ecs:eu-west-1:000000000000:cluster/cluster0", "cluster0")
    }

    #[tokio::test]
    async fn clusters_follow_pagination() {
        let mock = MockEcs {
            clusters: arns("cluster", 250),
            ..MockEcs::new(100)
        };
        let gatherer = EcsGatherer::new(mock);

        let clusters = gatherer.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 250);
        assert_eq!(clusters[0].name, "cluster0");
        assert_eq!(clusters[249].name, "cluster249");

        let requests = gatherer.api.list_requests.lock().unwrap().clone();
        let tokens = requests.iter().map(|r| r.next_token.clone()).collect::<Vec<_>>();
        assert_eq!(tokens, vec![None, Some("100".to_string()), Some("200".to_string())]);
        assert!(requests.iter().all(|r| r.max_results == API_MAX_RESULTS && r.cluster.is_none()));
        assert_eq!(gatherer.api.batches("DescribeClusters"), vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn services_are_described_in_batches_of_ten() {
        let mock = MockEcs {
            services: arns("service", 23),
            ..MockEcs::new(100)
        };
        let gatherer = EcsGatherer::new(mock);

        let services = gatherer.list_services(&cluster()).await.unwrap();
        assert_eq!(services.len(), 23);
        assert_eq!(services[0].name, "service0");
        assert_eq!(services[22].name, "service22");
        assert_eq!((services[5].desired, services[5].running, services[5].pending), (3, 2, 1));

        let mut batches = gatherer.api.batches("DescribeServices");
        batches.sort();
        assert_eq!(batches, vec![3, 10, 10]);

        let requests = gatherer.api.list_requests.lock().unwrap().clone();
        assert_eq!(requests[0].cluster.as_deref(), Some(cluster().id.as_str()));
    }

    #[tokio::test]
    async fn empty_lists_skip_describe() {
        let gatherer = EcsGatherer::new(MockEcs::new(100));

        assert!(gatherer.list_services(&cluster()).await.unwrap().is_empty());
        assert!(gatherer.list_container_instances(&cluster()).await.unwrap().is_empty());
        assert!(gatherer.api.describe_batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn describe_failure_fails_services() {
        let mock = MockEcs {
            services: arns("service", 15),
            fail_describe_services: true,
            ..MockEcs::new(100)
        };
        let err = EcsGatherer::new(mock).list_services(&cluster()).await.unwrap_err();
        assert!(format!("{err:?}").contains("ClientException"), "{err:?}");
    }

    #[tokio::test]
    async fn container_instances() {
        let mock = MockEcs {
            instances: arns("container-instance", 130),
            ..MockEcs::new(40)
        };
        let gatherer = EcsGatherer::new(mock);

        let instances = gatherer.list_container_instances(&cluster()).await.unwrap();
        assert_eq!(instances.len(), 130);
        assert_eq!(gatherer.api.list_requests.lock().unwrap().len(), 4);
        assert_eq!(gatherer.api.batches("DescribeContainerInstances"), vec![100, 30]);

        assert_eq!(
            instances[0],
            ContainerInstance {
                id: "arn:aws:ecs:eu-west-1:000000000000:container-instance/container-instance0".to_string(),
                instance_id: "i-00000000000000000".to_string(),
                agent_connected: true,
                active: true,
                pending_tasks: 0,
            }
        );
        assert!(!instances[1].active);
        assert!(!instances[1].agent_connected);
    }

    #[test]
    fn request_wire_format() {
        let request = ListRequest {
            cluster: Some("arn".to_string()),
            next_token: None,
            max_results: 100,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"cluster": "arn", "maxResults": 100})
        );

        let response: DescribeContainerInstancesResponse = serde_json::from_value(serde_json::json!({
            "containerInstances": [{
                "containerInstanceArn": "arn",
                "ec2InstanceId": "i-1",
                "agentConnected": true,
                "status": "ACTIVE",
                "pendingTasksCount": 2,
                "runningTasksCount": 5
            }],
            "failures": []
        }))
        .unwrap();
        assert_eq!(response.container_instances[0].ec2_instance_id, "i-1");
        assert_eq!(response.container_instances[0].pending_tasks_count, 2);
    }
}
