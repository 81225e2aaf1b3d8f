//! # ECS Exporter AWS Adapters
//!
//! Upstream access for the collector, speaking the AWS JSON protocols
//! directly over `reqwest` with Signature Version 4 signing.
//!
//! ## Key Components
//!
//! - **`CredentialsProvider`**: Credentials from the environment, the ECS task
//!   role or the EC2 instance profile
//! - **`signing`**: Signature Version 4
//! - **`AwsJsonClient`**: Signed requests against one service in one region
//! - **`EcsGatherer`**: The `ClusterGatherer` over the ECS API
//! - **`CloudWatchGatherer`**: The `MetricGatherer` over CloudWatch

#[macro_use]
extern crate tracing;

pub mod client;
pub mod cloudwatch;
pub mod credentials;
pub mod ecs;
pub mod error;
pub mod signing;

pub use client::AwsJsonClient;
pub use cloudwatch::{
    CloudWatchApi,
    CloudWatchClient,
    CloudWatchGatherer,
};
pub use credentials::{
    CredentialSource,
    Credentials,
    CredentialsProvider,
};
use ecs_exporter_collector::{
    ClusterGatherer,
    MetricGatherer,
};
pub use ecs::{
    EcsApi,
    EcsClient,
    EcsGatherer,
};
pub use error::AwsError;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
};
use url::Url;

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AwsError>> + Send + 'a>>;

/// The gatherers of a region. The metric gatherer is only built when `instance_metrics` is set.
pub fn gatherers(
    region: &str,
    endpoint: Option<Url>,
    credentials: Arc<CredentialsProvider>,
    instance_metrics: bool,
) -> Result<(Arc<dyn ClusterGatherer>, Option<Arc<dyn MetricGatherer>>), AwsError> {
    let ecs = EcsGatherer::new(EcsClient::new(region, endpoint.clone(), credentials.clone())?);

    let cloudwatch = if instance_metrics {
        let client = CloudWatchClient::new(region, endpoint, credentials)?;
        Some(Arc::new(CloudWatchGatherer::new(client)) as Arc<dyn MetricGatherer>)
    } else {
        None
    };

    Ok((Arc::new(ecs), cloudwatch))
}
