use clap::Parser;
use std::{
    path::PathBuf,
    time::Duration,
};

/// Prometheus exporter for AWS ECS clusters
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Optional YAML configuration file. Flags and environment variables take precedence.
    #[clap(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on for web interface and telemetry.
    #[clap(long = "web.listen-address", value_name = "ADDRESS")]
    pub listen_address: Option<String>,

    /// Path under which to expose metrics.
    #[clap(long = "web.telemetry-path", value_name = "PATH")]
    pub telemetry_path: Option<String>,

    /// The AWS region to get the metrics from.
    #[clap(long = "aws.region", value_name = "REGION")]
    pub aws_region: Option<String>,

    /// Override of the AWS API endpoint, e.g. for a local AWS emulation.
    #[clap(long = "aws.endpoint-url", value_name = "URL")]
    pub aws_endpoint: Option<url::Url>,

    /// Regex used to filter the cluster names, if doesn't match the cluster is ignored.
    #[clap(long = "aws.cluster-filter", value_name = "REGEX")]
    pub cluster_filter: Option<String>,

    /// Disable clusters container instances metrics gathering.
    #[clap(long = "metrics.disable-cinstances", action)]
    pub disable_container_instance_metrics: bool,

    /// Gather the CPU utilization of container instance hosts from CloudWatch.
    #[clap(long = "metrics.instance-cpu", action)]
    pub instance_cpu_metrics: bool,

    /// Budget of a single scrape, e.g. `10s` or `1m 30s`.
    #[clap(long = "collect.timeout", value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub collect_timeout: Option<Duration>,

    /// Clusters collected at the same time.
    #[clap(long = "collect.max-concurrency", value_name = "N")]
    pub max_concurrency: Option<u64>,

    /// Run exporter in debug mode.
    #[clap(long = "debug", action)]
    pub debug: bool,
}

mod config_ext {
    use super::*;
    use config::{
        Map,
        Source,
        Value,
    };
    use std::collections::HashMap;

    impl Source for Args {
        fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
            Box::new((*self).clone())
        }

        fn collect(&self) -> Result<Map<String, Value>, config::ConfigError> {
            let mut cache = HashMap::<String, Value>::new();
            if let Some(listen_address) = &self.listen_address {
                cache.insert("listen_address".to_string(), listen_address.clone().into());
            }
            if let Some(telemetry_path) = &self.telemetry_path {
                cache.insert("telemetry_path".to_string(), telemetry_path.clone().into());
            }
            if let Some(aws_region) = &self.aws_region {
                cache.insert("aws_region".to_string(), aws_region.clone().into());
            }
            if let Some(aws_endpoint) = &self.aws_endpoint {
                cache.insert("aws_endpoint".to_string(), aws_endpoint.to_string().into());
            }
            if let Some(cluster_filter) = &self.cluster_filter {
                cache.insert("cluster_filter".to_string(), cluster_filter.clone().into());
            }
            if self.disable_container_instance_metrics {
                cache.insert("disable_container_instance_metrics".to_string(), true.into());
            }
            if self.instance_cpu_metrics {
                cache.insert("instance_cpu_metrics".to_string(), true.into());
            }
            if let Some(collect_timeout) = self.collect_timeout {
                cache.insert(
                    "collect_timeout".to_string(),
                    humantime::format_duration(collect_timeout).to_string().into(),
                );
            }
            if let Some(max_concurrency) = self.max_concurrency {
                cache.insert("max_concurrency".to_string(), max_concurrency.into());
            }
            if self.debug {
                cache.insert("debug".to_string(), true.into());
            }
            Ok(cache)
        }
    }
}
