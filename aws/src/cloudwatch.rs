//! CloudWatch `GetMetricStatistics` and the CPU utilization gatherer built on it.

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
use chrono::{
    DateTime,
    Duration,
    Utc,
};
use ecs_exporter_collector::{
    GatherFuture,
    InstanceMetrics,
    MetricGatherer,
};
use eyre::{
    Result,
    WrapErr as _,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::sync::Arc;
use url::Url;

pub const CLOUDWATCH_SERVICE: ServiceSpec = ServiceSpec {
    name: "monitoring",
    target_prefix: "GraniteServiceVersion20100801",
    version: JsonVersion::V1_0,
};

pub const EC2_NAMESPACE: &str = "AWS/EC2";
pub const CPU_UTILIZATION: &str = "CPUUtilization";
pub const INSTANCE_ID_DIMENSION: &str = "InstanceId";
pub const STATISTIC_MAXIMUM: &str = "Maximum";

const PERIOD_SECONDS: i64 = 60;
const WINDOW_MINUTES: i64 = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetMetricStatisticsRequest {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<Dimension>,
    /// Epoch seconds.
    pub start_time: i64,
    /// Epoch seconds.
    pub end_time: i64,
    pub period: i64,
    pub statistics: Vec<String>,
}

impl GetMetricStatisticsRequest {
    /// Maximum of an EC2 instance metric per minute over the window ending at `now`.
    pub fn instance_maximum(instance_id: &str, metric_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            namespace: EC2_NAMESPACE.to_string(),
            metric_name: metric_name.to_string(),
            dimensions: vec![Dimension {
                name: INSTANCE_ID_DIMENSION.to_string(),
                value: instance_id.to_string(),
            }],
            start_time: (now - Duration::minutes(WINDOW_MINUTES)).timestamp(),
            end_time: now.timestamp(),
            period: PERIOD_SECONDS,
            statistics: vec![STATISTIC_MAXIMUM.to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Datapoint {
    /// Epoch seconds.
    pub timestamp: f64,
    pub maximum: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GetMetricStatisticsResponse {
    pub label: Option<String>,
    pub datapoints: Vec<Datapoint>,
}

impl GetMetricStatisticsResponse {
    /// Maximum of the most recent datapoint. Datapoints arrive unordered.
    pub fn latest_maximum(&self) -> Option<f64> {
        self.datapoints
            .iter()
            .filter(|datapoint| datapoint.maximum.is_some())
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
            .and_then(|datapoint| datapoint.maximum)
    }
}

pub trait CloudWatchApi: Send + Sync {
    fn get_metric_statistics(&self, request: GetMetricStatisticsRequest) -> ApiFuture<'_, GetMetricStatisticsResponse>;
}

#[derive(Debug, Clone)]
pub struct CloudWatchClient {
    client: AwsJsonClient,
}

impl CloudWatchClient {
    pub fn new(
        region: &str,
        endpoint: Option<Url>,
        credentials: Arc<CredentialsProvider>,
    ) -> Result<Self, AwsError> {
        Ok(Self {
            client: AwsJsonClient::new(CLOUDWATCH_SERVICE, region, endpoint, credentials)?,
        })
    }
}

impl CloudWatchApi for CloudWatchClient {
    fn get_metric_statistics(&self, request: GetMetricStatisticsRequest) -> ApiFuture<'_, GetMetricStatisticsResponse> {
        Box::pin(async move { self.client.call("GetMetricStatistics", &request).await })
    }
}

pub struct CloudWatchGatherer<A> {
    api: A,
}

impl<A: CloudWatchApi> CloudWatchGatherer<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub async fn cpu_utilization(&self, instance_id: &str) -> Result<InstanceMetrics> {
        debug!(instance = instance_id, "Getting metric '{CPU_UTILIZATION}'");
        let response = self
            .api
            .get_metric_statistics(GetMetricStatisticsRequest::instance_maximum(
                instance_id,
                CPU_UTILIZATION,
                Utc::now(),
            ))
            .await
            .wrap_err_with(|| format!("Failed getting {CPU_UTILIZATION} of {instance_id}"))?;

        Ok(InstanceMetrics {
            cpu_utilization: response.latest_maximum().unwrap_or_default(),
        })
    }
}

impl<A: CloudWatchApi> MetricGatherer for CloudWatchGatherer<A> {
    fn instance_metrics<'a>(&'a self, instance_id: &'a str) -> GatherFuture<'a, InstanceMetrics> {
        Box::pin(self.cpu_utilization(instance_id))
    }
}
